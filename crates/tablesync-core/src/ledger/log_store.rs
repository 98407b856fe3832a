//! Async persistence of the change-set log.
//!
//! This module owns every storage interaction under `_sync_log/`:
//! - Tracking the `CURRENT` pointer and interpreting the "no file" case as
//!   sequence `0` (empty generation).
//! - Writing zero-padded change-set files with an expected-sequence guard so
//!   each sequence number is created exactly once.
//! - Reverting a change-set file that was written but never published.
//! - Mapping storage failures into [`LedgerError`] variants so callers can tell
//!   conflicts, storage errors and corrupt state apart.
use std::path::{Path, PathBuf};

use chrono::Utc;
use snafu::{Backtrace, prelude::*};

use crate::{
    etag::DataETag,
    ledger::{
        ChangeSet, ConflictSnafu, CorruptStateSnafu, LedgerError, LedgerState, RowRecord,
        StorageSnafu,
    },
    storage::{self, StorageError, StorageLocation},
};

/// Reads and writes the change-set log under a generation root.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    location: StorageLocation,
}

impl LedgerStore {
    /// Name of the subdirectory containing the log.
    pub const LOG_DIR_NAME: &str = "_sync_log";
    /// Name of the file that stores the current sequence pointer.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Number of digits used in zero-padded change-set file names.
    pub const FILENAME_DIGITS: usize = 10;

    /// A store rooted at a generation directory.
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }

    /// The generation root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    fn current_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CURRENT_FILE_NAME)
    }

    fn change_set_rel_path(sequence: u64) -> PathBuf {
        let file_name = format!("{:0width$}.json", sequence, width = Self::FILENAME_DIGITS);
        Self::log_rel_dir().join(file_name)
    }

    async fn read_to_string_rel(&self, rel: &Path) -> Result<String, LedgerError> {
        storage::read_to_string(&self.location, rel)
            .await
            .context(StorageSnafu)
    }

    /// Load a single change set by sequence.
    ///
    /// Storage failures (including a missing file) are `LedgerError::Storage`;
    /// unparsable JSON is `LedgerError::CorruptState`.
    pub async fn load_change_set(&self, sequence: u64) -> Result<ChangeSet, LedgerError> {
        let rel = Self::change_set_rel_path(sequence);
        let json = self.read_to_string_rel(&rel).await?;
        serde_json::from_str(&json).map_err(|e| LedgerError::CorruptState {
            msg: format!("failed to parse change set {sequence}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Load the CURRENT sequence pointer.
    ///
    /// A missing CURRENT is a fresh generation (sequence 0). Empty or
    /// non-numeric content is `CorruptState`.
    pub async fn load_current_sequence(&self) -> Result<u64, LedgerError> {
        let rel = Self::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(LedgerError::Storage { source }),
        };

        let trimmed = contents.trim();
        ensure!(
            !trimmed.is_empty(),
            CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
        );
        trimmed
            .parse::<u64>()
            .map_err(|e| LedgerError::CorruptState {
                msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
                backtrace: Backtrace::capture(),
            })
    }

    /// Append a change set on top of `expected` with an optimistic guard.
    ///
    /// Steps:
    ///
    /// 1. Load CURRENT; if it is not `expected`, fail with
    ///    `LedgerError::Conflict`.
    /// 2. Create `_sync_log/<expected + 1>.json` with create-new semantics. If
    ///    another writer created it first this fails with
    ///    `StorageError::AlreadyExists` inside `LedgerError::Storage`.
    /// 3. Atomically replace CURRENT with the new sequence. Until this step
    ///    succeeds the change set is invisible to readers.
    ///
    /// Returns the change set as written.
    pub async fn commit_with_expected_sequence(
        &self,
        expected: u64,
        data_etag: DataETag,
        entries: Vec<RowRecord>,
    ) -> Result<ChangeSet, LedgerError> {
        let current = self.load_current_sequence().await?;
        ensure!(
            current == expected,
            ConflictSnafu {
                expected,
                found: current,
            }
        );

        let sequence = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "sequence counter overflow".to_string(),
        })?;

        let change_set = ChangeSet {
            sequence,
            base_sequence: expected,
            data_etag,
            timestamp: Utc::now(),
            entries,
        };

        let json = serde_json::to_vec(&change_set).map_err(|e| LedgerError::CorruptState {
            msg: format!("failed to serialize change set {sequence}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let rel = Self::change_set_rel_path(sequence);
        storage::write_new(&self.location, &rel, &json)
            .await
            .context(StorageSnafu)?;

        let current_contents = format!("{sequence}\n");
        storage::write_atomic(
            &self.location,
            &Self::current_rel_path(),
            current_contents.as_bytes(),
        )
        .await
        .context(StorageSnafu)?;

        log::debug!(
            "committed change set {sequence} ({} rows) at {}",
            change_set.entries.len(),
            self.location
        );
        Ok(change_set)
    }

    /// Remove a change set that was written but never published by CURRENT.
    ///
    /// Returns the reverted sequence, if there was one.
    pub async fn revert_pending_changes(&self) -> Result<Option<u64>, LedgerError> {
        let current = self.load_current_sequence().await?;
        let Some(pending) = current.checked_add(1) else {
            return Ok(None);
        };
        let rel = Self::change_set_rel_path(pending);
        match storage::remove(&self.location, &rel).await {
            Ok(()) => {
                log::warn!(
                    "reverted unpublished change set {pending} at {}",
                    self.location
                );
                Ok(Some(pending))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(source) => Err(LedgerError::Storage { source }),
        }
    }

    /// Rebuild the in-memory ledger by replaying every change set up to
    /// CURRENT. An empty log yields an empty state.
    pub async fn rebuild_ledger_state(&self) -> Result<LedgerState, LedgerError> {
        let current = self.load_current_sequence().await?;
        let mut state = LedgerState::default();
        for sequence in 1..=current {
            let change_set = self.load_change_set(sequence).await?;
            ensure!(
                change_set.sequence == sequence,
                CorruptStateSnafu {
                    msg: format!(
                        "change set sequence mismatch: expected {sequence}, found {} in payload",
                        change_set.sequence
                    ),
                }
            );
            state.apply(&change_set)?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        etag::RowETag,
        row::{RowDraft, RowUpdate},
        schema::{ColumnForest, ColumnSpec},
        storage::MemoryStore,
    };
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_store() -> (TempDir, LedgerStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let store = LedgerStore::new(StorageLocation::local(tmp.path()));
        (tmp, store)
    }

    fn record(row_id: &str, name: &str, data_etag: &DataETag) -> RowRecord {
        let forest = ColumnForest::build(&[ColumnSpec::new("name", "string")]).unwrap();
        let update = RowUpdate::new(row_id).value("name", name);
        let row = RowDraft::from_update(row_id, &update, &forest, None)
            .unwrap()
            .stamp(RowETag::generate(), data_etag.clone());
        RowRecord {
            row,
            previous_row_etag: None,
            user: None,
        }
    }

    async fn commit_one(store: &LedgerStore, expected: u64, row_id: &str) -> Result<ChangeSet, LedgerError> {
        let data_etag = DataETag::generate();
        let entry = record(row_id, "x", &data_etag);
        store
            .commit_with_expected_sequence(expected, data_etag, vec![entry])
            .await
    }

    #[tokio::test]
    async fn load_current_sequence_is_zero_without_current_file() -> TestResult {
        let (_tmp, store) = create_test_store();
        assert_eq!(store.load_current_sequence().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn load_current_sequence_handles_whitespace() -> TestResult {
        let (tmp, store) = create_test_store();
        let log_dir = tmp.path().join(LedgerStore::LOG_DIR_NAME);
        tokio::fs::create_dir_all(&log_dir).await?;
        tokio::fs::write(log_dir.join(LedgerStore::CURRENT_FILE_NAME), "  42  \n").await?;
        assert_eq!(store.load_current_sequence().await?, 42);
        Ok(())
    }

    #[tokio::test]
    async fn load_current_sequence_rejects_garbage() -> TestResult {
        let (tmp, store) = create_test_store();
        let log_dir = tmp.path().join(LedgerStore::LOG_DIR_NAME);
        tokio::fs::create_dir_all(&log_dir).await?;
        let current = log_dir.join(LedgerStore::CURRENT_FILE_NAME);

        tokio::fs::write(&current, "").await?;
        let err = store.load_current_sequence().await.expect_err("empty CURRENT");
        assert!(matches!(err, LedgerError::CorruptState { .. }));

        tokio::fs::write(&current, "abc").await?;
        let err = store.load_current_sequence().await.expect_err("garbage CURRENT");
        assert!(matches!(err, LedgerError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn commit_writes_padded_file_and_advances_current() -> TestResult {
        let (tmp, store) = create_test_store();
        let change_set = commit_one(&store, 0, "r1").await?;
        assert_eq!(change_set.sequence, 1);
        assert_eq!(change_set.base_sequence, 0);

        let file = tmp.path().join("_sync_log").join("0000000001.json");
        assert!(file.exists());
        let current = tokio::fs::read_to_string(tmp.path().join("_sync_log/CURRENT")).await?;
        assert_eq!(current, "1\n");

        let loaded = store.load_change_set(1).await?;
        assert_eq!(loaded, change_set);
        Ok(())
    }

    #[tokio::test]
    async fn commit_with_stale_expectation_conflicts() -> TestResult {
        let (_tmp, store) = create_test_store();
        commit_one(&store, 0, "r1").await?;
        let err = commit_one(&store, 0, "r2").await.expect_err("expected conflict");
        assert!(matches!(
            err,
            LedgerError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(store.load_current_sequence().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn existing_change_set_file_blocks_commit() -> TestResult {
        let (tmp, store) = create_test_store();
        let log_dir = tmp.path().join("_sync_log");
        tokio::fs::create_dir_all(&log_dir).await?;
        tokio::fs::write(log_dir.join("0000000001.json"), "{}").await?;

        let err = commit_one(&store, 0, "r1").await.expect_err("expected AlreadyExists");
        assert!(matches!(
            err,
            LedgerError::Storage {
                source: StorageError::AlreadyExists { .. }
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revert_pending_changes_removes_unpublished_file() -> TestResult {
        let memory = MemoryStore::new();
        let store = LedgerStore::new(StorageLocation::memory(memory.clone()));
        commit_one(&store, 0, "r1").await?;

        // Simulate a crash between writing change set 2 and publishing it.
        let data_etag = DataETag::generate();
        let orphan = ChangeSet {
            sequence: 2,
            base_sequence: 1,
            data_etag: data_etag.clone(),
            timestamp: Utc::now(),
            entries: vec![record("r2", "y", &data_etag)],
        };
        storage::write_new(
            store.location(),
            &LedgerStore::change_set_rel_path(2),
            &serde_json::to_vec(&orphan)?,
        )
        .await?;

        assert_eq!(store.revert_pending_changes().await?, Some(2));
        assert_eq!(store.revert_pending_changes().await?, None);

        // The sequence is free again.
        let next = commit_one(&store, 1, "r3").await?;
        assert_eq!(next.sequence, 2);
        let state = store.rebuild_ledger_state().await?;
        assert!(state.row("r2").is_none());
        assert!(state.row("r3").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_detects_sequence_mismatch() -> TestResult {
        let (tmp, store) = create_test_store();
        let first = commit_one(&store, 0, "r1").await?;
        let mut wrong = first.clone();
        wrong.sequence = 7;
        tokio::fs::write(
            tmp.path().join("_sync_log/0000000001.json"),
            serde_json::to_vec(&wrong)?,
        )
        .await?;

        let err = store.rebuild_ledger_state().await.expect_err("mismatch");
        assert!(matches!(err, LedgerError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_of_empty_log_is_empty() -> TestResult {
        let (_tmp, store) = create_test_store();
        let state = store.rebuild_ledger_state().await?;
        assert_eq!(state.sequence(), 0);
        assert!(state.data_etag().is_none());
        Ok(())
    }
}
