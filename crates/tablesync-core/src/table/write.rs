//! Row mutations.
//!
//! Every mutation follows the same order:
//!
//! 1. enter the generation fence (fails once the generation is retired);
//! 2. take the row lock(s), bounded by the configured timeout;
//! 3. plan the write against the stored row: compare-and-swap on the rowETag,
//!    consult the row state machine and the row-level access check;
//! 4. under the commit mutex, append one change set and apply it to the
//!    in-memory state.
//!
//! Planning never touches storage, so a rejected write leaves no trace. Bulk
//! writes plan every row first and commit the accepted ones as a single
//! change set.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::{MutexGuard, RwLockReadGuard};
use uuid::Uuid;

use crate::{
    access::{Caller, RowAction, TablePermission},
    config::ConflictPolicy,
    etag::{DataETag, RowETag},
    ledger::{ChangeSet, LedgerError, RowRecord},
    row::{Row, RowDraft, RowUpdate},
    storage::StorageError,
    table::{
        ConflictPair, ConflictResolution, ErrorKind, RowSyncEvent, RowSyncState, TableError,
        TableStore,
        error::{
            DataETagMismatchSnafu, GenerationRetiredSnafu, LedgerSnafu, LockTimeoutSnafu,
            NoConflictSnafu, RowNotFoundSnafu, RowPermissionDeniedSnafu, RowSnafu,
            VersionMismatchSnafu,
        },
    },
};

/// Result of one row of a bulk write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowOutcomeStatus {
    /// The row was written, or already had this content.
    Success,
    /// The row's rowETag was stale or the row is held in a conflict.
    InConflict,
    /// The row may not be written by the caller, or does not exist.
    Denied,
}

/// Outcome of one row of a bulk write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    /// Row the outcome is about.
    pub row_id: String,
    /// What happened.
    pub status: RowOutcomeStatus,
    /// The stored row after the batch, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    /// Reason for a non-successful outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcomes of a bulk write, in submission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcomeList {
    /// One outcome per submitted row.
    pub rows: Vec<RowOutcome>,
    /// dataETag after the batch.
    #[serde(rename = "dataETag")]
    pub data_etag: Option<DataETag>,
    /// Ledger sequence after the batch.
    pub sequence_value: u64,
}

enum Plan {
    /// Commit a new version.
    Write {
        draft: RowDraft,
        previous: Option<RowETag>,
    },
    /// Nothing to write; report this row.
    Unchanged(Row),
    /// The write lost; hold it as a new conflict pair.
    Conflict(ConflictPair),
}

fn new_row_id() -> String {
    format!("uuid:{}", Uuid::new_v4())
}

impl TableStore {
    async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>, TableError> {
        let guard = self.fence.read().await;
        ensure!(
            !self.is_retired(),
            GenerationRetiredSnafu {
                schema_etag: self.identity.schema_etag.clone(),
            }
        );
        Ok(guard)
    }

    fn check_row_access(
        &self,
        caller: &Caller,
        action: RowAction,
        row: &Row,
    ) -> Result<(), TableError> {
        ensure!(
            caller.can_access_row(
                &self.identity.app_id,
                &self.identity.table_id,
                action,
                &row.filter_scope
            ),
            RowPermissionDeniedSnafu {
                principal: caller.principal.id.as_str(),
                action,
                row_id: row.row_id.as_str(),
            }
        );
        Ok(())
    }

    /// Decide what `update` does to `current`. Pure apart from reading the
    /// conflict map.
    fn plan(
        &self,
        caller: &Caller,
        row_id: &str,
        update: &RowUpdate,
        current: Option<&Row>,
        sequence: u64,
    ) -> Result<Plan, TableError> {
        let in_conflict = self.conflict(row_id);
        let state = RowSyncState::of(current, in_conflict.is_some());
        let event = if update.deleted {
            RowSyncEvent::Delete
        } else {
            RowSyncEvent::Edit
        };
        let supplied = update.row_etag.as_ref().filter(|e| !e.as_str().is_empty());

        let pending = match (state.on(event), in_conflict) {
            (Ok(pending), _) => pending,
            (Err(_), Some(pair)) => {
                return Err(TableError::RowInConflict {
                    row_id: row_id.to_string(),
                    pair: Box::new(pair),
                });
            }
            // The only other undefined move is deleting a tombstone.
            (Err(_), None) => {
                return match current {
                    Some(row) => Ok(Plan::Unchanged(row.clone())),
                    None => RowNotFoundSnafu { row_id }.fail(),
                };
            }
        };

        let Some(current) = current else {
            // Insert: there is nothing to delete and no version to match.
            ensure!(!update.deleted && supplied.is_none(), RowNotFoundSnafu { row_id });
            let draft =
                RowDraft::from_update(row_id, update, &self.forest, None).context(RowSnafu)?;
            return Ok(Plan::Write {
                draft,
                previous: None,
            });
        };

        let action = if update.deleted {
            RowAction::Delete
        } else {
            RowAction::Write
        };
        self.check_row_access(caller, action, current)?;

        let draft = if update.deleted {
            RowDraft::tombstone_of(current)
        } else {
            RowDraft::from_update(row_id, update, &self.forest, Some(current))
                .context(RowSnafu)?
        };

        let push = if supplied == Some(&current.row_etag) {
            RowSyncEvent::PushAccepted
        } else {
            RowSyncEvent::PushStale
        };
        match pending.on(push) {
            Ok(RowSyncState::Rest | RowSyncState::Tombstoned) => {
                return Ok(Plan::Write {
                    draft,
                    previous: Some(current.row_etag.clone()),
                });
            }
            _ if current.has_matching_significant_fields(&draft) => {
                // A re-submission of what is already stored.
                return Ok(Plan::Unchanged(current.clone()));
            }
            _ => {}
        }

        match self.config.conflict_policy {
            ConflictPolicy::Reject => VersionMismatchSnafu {
                row_id,
                supplied: supplied.cloned(),
                current: current.row_etag.clone(),
            }
            .fail(),
            ConflictPolicy::PreserveConflicts => {
                let base = supplied.cloned().unwrap_or_else(|| RowETag::new(""));
                let local = draft.stamp(base, current.data_etag_at_modification.clone());
                Ok(Plan::Conflict(ConflictPair::new(local, current.clone(), sequence)))
            }
        }
    }

    fn hold_conflict(&self, pair: ConflictPair) {
        log::info!(
            "row {} of {} is in conflict ({:?} vs {:?})",
            pair.row_id,
            self.identity,
            pair.local.conflict_type,
            pair.server.conflict_type
        );
        self.conflict_map().insert(pair.row_id.clone(), pair);
    }

    /// Append `entries` as the next change set and apply it to the state.
    ///
    /// The caller holds the commit mutex.
    async fn commit(
        &self,
        _commit: &MutexGuard<'_, ()>,
        data_etag: DataETag,
        entries: Vec<RowRecord>,
    ) -> Result<ChangeSet, TableError> {
        let expected = self.state.read().await.sequence();
        let change_set = match self
            .ledger
            .commit_with_expected_sequence(expected, data_etag, entries)
            .await
        {
            Ok(change_set) => change_set,
            Err(err) => {
                let unpublished = matches!(
                    &err,
                    LedgerError::Storage { source }
                        if !matches!(source, StorageError::AlreadyExists { .. })
                );
                if unpublished {
                    if let Err(revert) = self.ledger.revert_pending_changes().await {
                        log::warn!("failed to revert change set after {err}: {revert}");
                    }
                }
                return Err(TableError::Ledger { source: err });
            }
        };
        self.state
            .write()
            .await
            .apply(&change_set)
            .context(LedgerSnafu)?;
        Ok(change_set)
    }

    async fn write_one(
        &self,
        caller: &Caller,
        row_id: String,
        update: RowUpdate,
    ) -> Result<Row, TableError> {
        let _fence = self.enter().await?;
        let _row = self
            .row_locks
            .lock_timeout(&row_id, self.config.lock_timeout())
            .await
            .context(LockTimeoutSnafu { row_id: row_id.as_str() })?;

        let (current, sequence) = {
            let state = self.state.read().await;
            (state.row(&row_id).cloned(), state.sequence())
        };

        match self.plan(caller, &row_id, &update, current.as_ref(), sequence)? {
            Plan::Unchanged(row) => Ok(row),
            Plan::Conflict(pair) => {
                self.hold_conflict(pair.clone());
                Err(TableError::RowInConflict {
                    row_id,
                    pair: Box::new(pair),
                })
            }
            Plan::Write { draft, previous } => {
                let commit = self.commit_lock.lock().await;
                let data_etag = DataETag::generate();
                let row = draft.stamp(RowETag::generate(), data_etag.clone());
                let record = RowRecord {
                    row: row.clone(),
                    previous_row_etag: previous,
                    user: Some(caller.principal.id.clone()),
                };
                self.commit(&commit, data_etag, vec![record]).await?;
                Ok(row)
            }
        }
    }

    /// Insert a row, or update it when `update.row_etag` is its current
    /// rowETag.
    ///
    /// A missing `row_id` allocates a fresh one. A stale rowETag fails with
    /// [`TableError::VersionMismatch`] or, under the conflict-preserving
    /// policy, [`TableError::RowInConflict`]; re-submitting content that is
    /// already stored returns the stored row instead. Updating a tombstone
    /// with its rowETag brings the row back.
    pub async fn create_or_update_row(
        &self,
        caller: &Caller,
        update: RowUpdate,
    ) -> Result<Row, TableError> {
        let row_id = update.row_id.clone().unwrap_or_else(new_row_id);
        self.write_one(caller, row_id, update).await
    }

    /// Turn a row into a tombstone. Deleting a tombstone returns it
    /// unchanged.
    pub async fn delete_row(
        &self,
        caller: &Caller,
        row_id: &str,
        row_etag: Option<RowETag>,
    ) -> Result<Row, TableError> {
        let update = RowUpdate {
            row_id: Some(row_id.to_string()),
            row_etag,
            deleted: true,
            ..RowUpdate::default()
        };
        self.write_one(caller, row_id.to_string(), update).await
    }

    /// Apply many updates against an expected dataETag.
    ///
    /// Fails with [`TableError::DataETagMismatch`] when the table moved past
    /// `expected`. Otherwise every row gets an outcome and the successful
    /// ones commit as one change set. Invalid row content fails the whole
    /// batch.
    pub async fn insert_or_update_rows(
        &self,
        caller: &Caller,
        expected: Option<&DataETag>,
        updates: Vec<RowUpdate>,
    ) -> Result<RowOutcomeList, TableError> {
        let _fence = self.enter().await?;
        let updates: Vec<(String, RowUpdate)> = updates
            .into_iter()
            .map(|u| (u.row_id.clone().unwrap_or_else(new_row_id), u))
            .collect();
        let _rows = self
            .row_locks
            .lock_many(
                updates.iter().map(|(id, _)| id.as_str()),
                self.config.lock_timeout(),
            )
            .await
            .context(LockTimeoutSnafu {
                row_id: updates.first().map(|(id, _)| id.as_str()).unwrap_or_default(),
            })?;
        let commit = self.commit_lock.lock().await;

        let data_etag = DataETag::generate();
        let mut outcomes = Vec::with_capacity(updates.len());
        let mut entries: Vec<RowRecord> = Vec::new();
        let mut staged: HashMap<String, usize> = HashMap::new();
        let mut new_conflicts = Vec::new();
        {
            let state = self.state.read().await;
            let current_etag = state.data_etag();
            ensure!(
                expected == current_etag,
                DataETagMismatchSnafu {
                    expected: expected.cloned(),
                    current: current_etag.cloned(),
                }
            );

            for (row_id, update) in &updates {
                let current = match staged.get(row_id) {
                    Some(&idx) => Some(entries[idx].row.clone()),
                    None => state.row(row_id).cloned(),
                };
                let planned =
                    self.plan(caller, row_id, update, current.as_ref(), state.sequence());
                let plan = match planned {
                    Ok(plan) => plan,
                    Err(err) => {
                        let status = match err.kind() {
                            ErrorKind::VersionMismatch | ErrorKind::Conflict => {
                                RowOutcomeStatus::InConflict
                            }
                            ErrorKind::PermissionDenied | ErrorKind::NotFound => {
                                RowOutcomeStatus::Denied
                            }
                            _ => return Err(err),
                        };
                        outcomes.push(RowOutcome {
                            row_id: row_id.clone(),
                            status,
                            row: current,
                            message: Some(err.to_string()),
                        });
                        continue;
                    }
                };

                match plan {
                    Plan::Unchanged(row) => outcomes.push(RowOutcome {
                        row_id: row_id.clone(),
                        status: RowOutcomeStatus::Success,
                        row: Some(row),
                        message: None,
                    }),
                    Plan::Conflict(pair) => {
                        outcomes.push(RowOutcome {
                            row_id: row_id.clone(),
                            status: RowOutcomeStatus::InConflict,
                            row: current,
                            message: Some(format!("row {row_id} is in conflict")),
                        });
                        new_conflicts.push(pair);
                    }
                    Plan::Write { draft, previous } => {
                        let row = draft.stamp(RowETag::generate(), data_etag.clone());
                        match staged.get(row_id) {
                            // A second write to the same row in one batch
                            // replaces the first but keeps its base version.
                            Some(&idx) => entries[idx].row = row.clone(),
                            None => {
                                staged.insert(row_id.clone(), entries.len());
                                entries.push(RowRecord {
                                    row: row.clone(),
                                    previous_row_etag: previous,
                                    user: Some(caller.principal.id.clone()),
                                });
                            }
                        }
                        outcomes.push(RowOutcome {
                            row_id: row_id.clone(),
                            status: RowOutcomeStatus::Success,
                            row: Some(row),
                            message: None,
                        });
                    }
                }
            }
        }

        if !entries.is_empty() {
            self.commit(&commit, data_etag, entries).await?;
        }
        for pair in new_conflicts {
            self.hold_conflict(pair);
        }

        let state = self.state.read().await;
        Ok(RowOutcomeList {
            rows: outcomes,
            data_etag: state.data_etag().cloned(),
            sequence_value: state.sequence(),
        })
    }

    /// Settle the conflict pair of `row_id`.
    ///
    /// `TakeServer` keeps the stored row. `TakeLocal` writes the client's
    /// content on top of the stored row's current version. Either way the
    /// pair is removed and the resulting row returned.
    pub async fn resolve_conflict(
        &self,
        caller: &Caller,
        row_id: &str,
        resolution: ConflictResolution,
    ) -> Result<Row, TableError> {
        let _fence = self.enter().await?;
        let _row = self
            .row_locks
            .lock_timeout(row_id, self.config.lock_timeout())
            .await
            .context(LockTimeoutSnafu { row_id })?;

        let pair = self.conflict(row_id).context(NoConflictSnafu { row_id })?;
        let current = self
            .state
            .read()
            .await
            .row(row_id)
            .cloned()
            .context(RowNotFoundSnafu { row_id })?;

        let resolved = match resolution {
            ConflictResolution::TakeServer => current,
            ConflictResolution::TakeLocal => {
                let action = if pair.local.row.deleted {
                    // Taking a stale delete deletes the row, which needs the
                    // table permission as well as the row scope.
                    ensure!(
                        caller.policy.has_permission(
                            &caller.principal,
                            &self.identity.app_id,
                            &self.identity.table_id,
                            TablePermission::DeleteRow,
                        ),
                        RowPermissionDeniedSnafu {
                            principal: caller.principal.id.as_str(),
                            action: RowAction::Delete,
                            row_id,
                        }
                    );
                    RowAction::Delete
                } else {
                    RowAction::Write
                };
                self.check_row_access(caller, action, &current)?;
                let draft = pair.local.row.to_draft();
                if current.has_matching_significant_fields(&draft) {
                    current
                } else {
                    let commit = self.commit_lock.lock().await;
                    let data_etag = DataETag::generate();
                    let row = draft.stamp(RowETag::generate(), data_etag.clone());
                    let record = RowRecord {
                        row: row.clone(),
                        previous_row_etag: Some(current.row_etag.clone()),
                        user: Some(caller.principal.id.clone()),
                    };
                    self.commit(&commit, data_etag, vec![record]).await?;
                    row
                }
            }
        };

        let settled = RowSyncState::Conflicting.on(RowSyncEvent::Resolved {
            tombstone: resolved.deleted,
        });
        log::debug!("resolved conflict on row {row_id} ({resolution:?}) -> {settled:?}");
        self.conflict_map().remove(row_id);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::{Principal, StaticAccessPolicy, TablePermission},
        config::EngineConfig,
        etag::SchemaETag,
        row::{RowAccess, RowFilterScope},
        schema::{ColumnForest, ColumnSpec},
        storage::{MemoryStore, StorageLocation},
        table::{ConflictType, TableIdentity},
    };
    use std::sync::Arc;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn store_with(policy: ConflictPolicy) -> TableStore {
        let forest = ColumnForest::build(&[
            ColumnSpec::new("name", "string"),
            ColumnSpec::new("age", "integer"),
        ])
        .unwrap();
        TableStore::create(
            TableIdentity::new("app", "people", SchemaETag::new("uuid:s1")),
            forest,
            StorageLocation::memory(MemoryStore::new()),
            EngineConfig::default().with_conflict_policy(policy),
        )
        .await
        .unwrap()
    }

    fn person(row_id: &str, name: &str, age: &str) -> RowUpdate {
        RowUpdate::new(row_id).value("name", name).value("age", age)
    }

    #[tokio::test]
    async fn insert_update_and_stale_update() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let caller = Caller::system();

        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        let d1 = store.version().await.data_etag.unwrap();
        assert_eq!(v1.data_etag_at_modification, d1);

        let v2 = store
            .create_or_update_row(&caller, person("r1", "A", "2").with_etag(v1.row_etag.clone()))
            .await?;
        assert_ne!(v2.row_etag, v1.row_etag);
        let d2 = store.version().await.data_etag.unwrap();
        assert_ne!(d1, d2);

        let err = store
            .create_or_update_row(&caller, person("r1", "B", "3").with_etag(v1.row_etag.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::VersionMismatch { .. }), "{err}");
        assert_eq!(store.get_row("r1").await?, v2);
        assert_eq!(store.version().await.sequence_value, 2);
        Ok(())
    }

    #[tokio::test]
    async fn insert_with_etag_of_missing_row_is_not_found() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let err = store
            .create_or_update_row(
                &Caller::system(),
                person("r9", "A", "1").with_etag(RowETag::new("uuid:ghost")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::RowNotFound { .. }));
        assert_eq!(store.version().await.sequence_value, 0);
        Ok(())
    }

    #[tokio::test]
    async fn stale_resubmission_of_stored_content_is_idempotent() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let caller = Caller::system();
        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        let again = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        assert_eq!(again, v1);
        assert_eq!(store.version().await.sequence_value, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_then_resurrect() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let caller = Caller::system();
        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;

        let tomb = store.delete_row(&caller, "r1", Some(v1.row_etag.clone())).await?;
        assert!(tomb.deleted);
        assert_eq!(tomb.value("name"), Some("A"));

        // Deleting again returns the tombstone without a new change set.
        let again = store.delete_row(&caller, "r1", None).await?;
        assert_eq!(again, tomb);
        assert_eq!(store.version().await.sequence_value, 2);

        let back = store
            .create_or_update_row(&caller, person("r1", "C", "5").with_etag(tomb.row_etag.clone()))
            .await?;
        assert!(!back.deleted);
        assert_eq!(back.value("name"), Some("C"));

        let err = store.delete_row(&caller, "nope", None).await.unwrap_err();
        assert!(matches!(err, TableError::RowNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_columns_are_rejected_before_commit() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let err = store
            .create_or_update_row(&Caller::system(), RowUpdate::new("r1").value("colour", "red"))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Row { .. }));
        assert_eq!(store.version().await.sequence_value, 0);
        Ok(())
    }

    #[tokio::test]
    async fn preserve_policy_holds_conflicts_until_resolved() -> TestResult {
        let store = store_with(ConflictPolicy::PreserveConflicts).await;
        let caller = Caller::system();
        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        let v2 = store
            .create_or_update_row(&caller, person("r1", "A", "2").with_etag(v1.row_etag.clone()))
            .await?;

        let err = store
            .create_or_update_row(&caller, person("r1", "Z", "9").with_etag(v1.row_etag.clone()))
            .await
            .unwrap_err();
        let TableError::RowInConflict { pair, .. } = err else {
            panic!("expected a conflict, got {err}");
        };
        assert_eq!(pair.local.conflict_type, ConflictType::LocalUpdatedUpdatedValues);
        assert_eq!(pair.server.conflict_type, ConflictType::ServerUpdatedUpdatedValues);
        assert_eq!(pair.server.row, v2);
        assert_eq!(pair.local_base_etag(), &v1.row_etag);

        // Even a correctly versioned write waits for resolution.
        let err = store
            .create_or_update_row(&caller, person("r1", "Q", "0").with_etag(v2.row_etag.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::RowInConflict { .. }));
        assert_eq!(store.conflicts().len(), 1);

        let resolved = store
            .resolve_conflict(&caller, "r1", ConflictResolution::TakeLocal)
            .await?;
        assert_eq!(resolved.value("name"), Some("Z"));
        assert_ne!(resolved.row_etag, v2.row_etag);
        assert!(store.conflicts().is_empty());

        let err = store
            .resolve_conflict(&caller, "r1", ConflictResolution::TakeServer)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::NoConflict { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn server_side_resolution_keeps_the_stored_row() -> TestResult {
        let store = store_with(ConflictPolicy::PreserveConflicts).await;
        let caller = Caller::system();
        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        let tomb = store.delete_row(&caller, "r1", Some(v1.row_etag.clone())).await?;

        let err = store
            .create_or_update_row(&caller, person("r1", "B", "1").with_etag(v1.row_etag.clone()))
            .await
            .unwrap_err();
        let TableError::RowInConflict { pair, .. } = err else {
            panic!("expected a conflict, got {err}");
        };
        assert_eq!(pair.server.conflict_type, ConflictType::ServerDeletedOldValues);

        let kept = store
            .resolve_conflict(&caller, "r1", ConflictResolution::TakeServer)
            .await?;
        assert_eq!(kept, tomb);
        assert_eq!(store.version().await.sequence_value, 2);
        Ok(())
    }

    #[tokio::test]
    async fn bulk_write_reports_per_row_outcomes() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let caller = Caller::system();
        let v1 = store.create_or_update_row(&caller, person("r1", "A", "1")).await?;
        let d1 = store.version().await.data_etag;

        let outcomes = store
            .insert_or_update_rows(
                &caller,
                d1.as_ref(),
                vec![
                    person("r1", "A", "2").with_etag(v1.row_etag.clone()),
                    person("r2", "B", "1"),
                    person("r3", "C", "1").with_etag(RowETag::new("uuid:ghost")),
                ],
            )
            .await?;
        let statuses: Vec<RowOutcomeStatus> = outcomes.rows.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                RowOutcomeStatus::Success,
                RowOutcomeStatus::Success,
                RowOutcomeStatus::Denied
            ]
        );
        // One change set for the whole batch.
        assert_eq!(outcomes.sequence_value, 2);
        let d2 = outcomes.data_etag.clone().unwrap();
        assert_eq!(store.get_row("r2").await?.data_etag_at_modification, d2);

        // The table has moved on; the old dataETag is rejected.
        let err = store
            .insert_or_update_rows(&caller, d1.as_ref(), vec![person("r4", "D", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::DataETagMismatch { .. }));

        let stale = store
            .insert_or_update_rows(
                &caller,
                Some(&d2),
                vec![person("r1", "X", "0").with_etag(v1.row_etag.clone())],
            )
            .await?;
        assert_eq!(stale.rows[0].status, RowOutcomeStatus::InConflict);
        assert_eq!(stale.sequence_value, 2);
        Ok(())
    }

    #[tokio::test]
    async fn row_level_access_is_enforced() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        let owner = Caller::system();
        let row = store
            .create_or_update_row(
                &owner,
                person("r1", "A", "1")
                    .with_filter_scope(RowFilterScope::new(RowAccess::ReadOnly).owned_by("carol")),
            )
            .await?;

        let policy = StaticAccessPolicy::new()
            .grant_user("mallory", [TablePermission::ReadRow, TablePermission::WriteRow]);
        let mallory = Caller::new(Principal::new("mallory"), Arc::new(policy));
        let err = store
            .create_or_update_row(&mallory, person("r1", "B", "2").with_etag(row.row_etag.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::RowPermissionDenied { .. }));
        assert_eq!(store.get_row("r1").await?, row);
        Ok(())
    }

    #[tokio::test]
    async fn taking_a_stale_delete_needs_delete_permission() -> TestResult {
        let store = store_with(ConflictPolicy::PreserveConflicts).await;
        let admin = Caller::system();
        let v1 = store.create_or_update_row(&admin, person("r1", "A", "1")).await?;
        let v2 = store
            .create_or_update_row(&admin, person("r1", "A", "2").with_etag(v1.row_etag.clone()))
            .await?;
        let err = store
            .delete_row(&admin, "r1", Some(v1.row_etag.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::RowInConflict { .. }), "{err}");

        let policy = StaticAccessPolicy::new()
            .grant_user("bob", [TablePermission::ReadRow, TablePermission::WriteRow]);
        let bob = Caller::new(Principal::new("bob"), Arc::new(policy));
        let err = store
            .resolve_conflict(&bob, "r1", ConflictResolution::TakeLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::RowPermissionDenied { .. }), "{err}");
        assert_eq!(store.get_row("r1").await?, v2);
        assert_eq!(store.conflicts().len(), 1);

        let resolved = store
            .resolve_conflict(&admin, "r1", ConflictResolution::TakeLocal)
            .await?;
        assert!(resolved.deleted);
        assert!(store.conflicts().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn retired_generation_refuses_writes() -> TestResult {
        let store = store_with(ConflictPolicy::Reject).await;
        drop(store.retire().await);
        let err = store
            .create_or_update_row(&Caller::system(), person("r1", "A", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::GenerationRetired { .. }));

        store.reinstate();
        store
            .create_or_update_row(&Caller::system(), person("r1", "A", "1"))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_commit_leaves_state_untouched_and_recovers() -> TestResult {
        let memory = MemoryStore::new();
        let forest = ColumnForest::build(&[ColumnSpec::new("name", "string")]).unwrap();
        let store = TableStore::create(
            TableIdentity::new("app", "t", SchemaETag::new("uuid:s1")),
            forest,
            StorageLocation::memory(memory.clone()),
            EngineConfig::default(),
        )
        .await?;
        let caller = Caller::system();

        memory.inject_write_failures(true);
        let err = store
            .create_or_update_row(&caller, RowUpdate::new("r1").value("name", "A"))
            .await
            .unwrap_err();
        assert!(err.is_retriable(), "{err}");
        assert!(store.get_row("r1").await.is_err());

        memory.inject_write_failures(false);
        store
            .create_or_update_row(&caller, RowUpdate::new("r1").value("name", "A"))
            .await?;
        assert_eq!(store.version().await.sequence_value, 1);
        Ok(())
    }
}
