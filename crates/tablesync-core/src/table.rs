//! Table store: one realized table generation.
//!
//! A [`TableStore`] owns the rows of `(appId, tableId, schemaETag)`. Its state
//! lives under a generation root:
//!
//! ```text
//! <generation root>/
//!   definition.json     # identity + column specs, written once
//!   _sync_log/          # change-set log (see crate::ledger)
//! ```
//!
//! Opening a store reverts any change set left unpublished by a crash, then
//! replays the log into a [`LedgerState`]. Writes (see `write.rs`) serialize
//! per row through [`KeyLocks`] and per table through a commit mutex; readers
//! (see `crate::feed`) take a read lock on the state and never wait for I/O.
pub mod conflict;
pub mod error;
pub mod sync_state;
mod write;

pub use conflict::{ConflictPair, ConflictResolution, ConflictType, TaggedRow};
pub use error::{ErrorKind, TableError};
pub use sync_state::{InvalidTransition, RowSyncEvent, RowSyncState};
pub use write::{RowOutcome, RowOutcomeList, RowOutcomeStatus};

use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    config::EngineConfig,
    etag::{DataETag, SchemaETag},
    ledger::{LedgerState, LedgerStore},
    row::Row,
    schema::{ColumnForest, ColumnSpec},
    storage::{self, KeyLocks, StorageError, StorageLocation},
};

use error::{GenerationExistsSnafu, LedgerSnafu, RowNotFoundSnafu, SchemaSnafu, StorageSnafu};

/// The triple that names a realized table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableIdentity {
    /// Application the table belongs to.
    pub app_id: String,
    /// Table id, unique within the application.
    pub table_id: String,
    /// Generation.
    #[serde(rename = "schemaETag")]
    pub schema_etag: SchemaETag,
}

impl TableIdentity {
    /// Build an identity.
    pub fn new(
        app_id: impl Into<String>,
        table_id: impl Into<String>,
        schema_etag: SchemaETag,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            table_id: table_id.into(),
            schema_etag,
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.app_id, self.table_id, self.schema_etag)
    }
}

/// Persisted definition of a generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Which table and generation.
    #[serde(flatten)]
    pub identity: TableIdentity,
    /// Column list as submitted, sorted by elementKey.
    pub columns: Vec<ColumnSpec>,
    /// When the generation was created.
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the version counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableVersion {
    /// Current dataETag, `None` before the first write.
    #[serde(rename = "dataETag")]
    pub data_etag: Option<DataETag>,
    /// Current ledger sequence.
    pub sequence_value: u64,
}

/// Rows and history of one table generation.
#[derive(Debug)]
pub struct TableStore {
    identity: TableIdentity,
    definition: TableDefinition,
    forest: Arc<ColumnForest>,
    config: EngineConfig,
    ledger: LedgerStore,
    state: RwLock<LedgerState>,
    commit_lock: tokio::sync::Mutex<()>,
    row_locks: KeyLocks,
    conflicts: Mutex<BTreeMap<String, ConflictPair>>,
    fence: RwLock<()>,
    retired: AtomicBool,
}

impl TableStore {
    /// Name of the file holding the generation's definition.
    pub const DEFINITION_FILE_NAME: &str = "definition.json";

    /// Create a new, empty generation at `location`.
    ///
    /// Fails with [`TableError::GenerationExists`] when a definition is
    /// already stored there.
    pub async fn create(
        identity: TableIdentity,
        forest: ColumnForest,
        location: StorageLocation,
        config: EngineConfig,
    ) -> Result<Self, TableError> {
        let definition = TableDefinition {
            identity: identity.clone(),
            columns: forest.to_specs(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&definition).map_err(|e| TableError::CorruptDefinition {
            location: location.to_string(),
            msg: e.to_string(),
        })?;

        match storage::write_new(&location, Path::new(Self::DEFINITION_FILE_NAME), &json).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return GenerationExistsSnafu {
                    schema_etag: identity.schema_etag,
                }
                .fail();
            }
            Err(source) => return Err(TableError::Storage { source }),
        }

        log::info!("created table generation {identity} at {location}");
        Ok(Self::assemble(
            definition,
            forest,
            LedgerStore::new(location),
            LedgerState::default(),
            config,
        ))
    }

    /// Open an existing generation: read its definition, revert any
    /// unpublished change set and replay the log.
    pub async fn open(location: StorageLocation, config: EngineConfig) -> Result<Self, TableError> {
        let json = storage::read_to_string(&location, Path::new(Self::DEFINITION_FILE_NAME))
            .await
            .context(StorageSnafu)?;
        let definition: TableDefinition =
            serde_json::from_str(&json).map_err(|e| TableError::CorruptDefinition {
                location: location.to_string(),
                msg: e.to_string(),
            })?;
        let forest = ColumnForest::build(&definition.columns).context(SchemaSnafu)?;

        let ledger = LedgerStore::new(location);
        ledger.revert_pending_changes().await.context(LedgerSnafu)?;
        let state = ledger.rebuild_ledger_state().await.context(LedgerSnafu)?;
        log::debug!(
            "opened table generation {} at sequence {}",
            definition.identity,
            state.sequence()
        );
        Ok(Self::assemble(definition, forest, ledger, state, config))
    }

    fn assemble(
        definition: TableDefinition,
        forest: ColumnForest,
        ledger: LedgerStore,
        state: LedgerState,
        config: EngineConfig,
    ) -> Self {
        Self {
            identity: definition.identity.clone(),
            definition,
            forest: Arc::new(forest),
            config,
            ledger,
            state: RwLock::new(state),
            commit_lock: tokio::sync::Mutex::new(()),
            row_locks: KeyLocks::new(),
            conflicts: Mutex::new(BTreeMap::new()),
            fence: RwLock::new(()),
            retired: AtomicBool::new(false),
        }
    }

    /// Which table and generation this is.
    pub fn identity(&self) -> &TableIdentity {
        &self.identity
    }

    /// Stored definition.
    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    /// Compiled column forest.
    pub fn forest(&self) -> &Arc<ColumnForest> {
        &self.forest
    }

    /// Configuration the store runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generation root.
    pub fn location(&self) -> &StorageLocation {
        self.ledger.location()
    }

    /// True once a schema change has replaced this generation.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Current dataETag and sequence.
    pub async fn version(&self) -> TableVersion {
        let state = self.state.read().await;
        TableVersion {
            data_etag: state.data_etag().cloned(),
            sequence_value: state.sequence(),
        }
    }

    /// Read access to the materialized ledger.
    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().await
    }

    /// The stored row, tombstones included.
    pub async fn get_row(&self, row_id: &str) -> Result<Row, TableError> {
        let state = self.state.read().await;
        state
            .row(row_id)
            .cloned()
            .context(RowNotFoundSnafu { row_id })
    }

    /// Pending conflict pairs, ordered by rowId.
    pub fn conflicts(&self) -> Vec<ConflictPair> {
        self.conflict_map().values().cloned().collect()
    }

    /// The pending conflict pair of `row_id`, if any.
    pub fn conflict(&self, row_id: &str) -> Option<ConflictPair> {
        self.conflict_map().get(row_id).cloned()
    }

    fn conflict_map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ConflictPair>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.conflicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Retire the generation.
    ///
    /// Waits for every in-flight mutation to finish, then marks the store so
    /// later mutations fail with [`TableError::GenerationRetired`]. The
    /// returned guard keeps new mutations out until it is dropped.
    pub async fn retire(&self) -> RwLockWriteGuard<'_, ()> {
        let guard = self.fence.write().await;
        self.retired.store(true, Ordering::Release);
        log::info!("retired table generation {}", self.identity);
        guard
    }

    /// Undo [`TableStore::retire`] after a schema change failed.
    pub fn reinstate(&self) {
        self.retired.store(false, Ordering::Release);
        log::warn!("reinstated table generation {}", self.identity);
    }
}
