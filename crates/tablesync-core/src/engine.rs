//! Engine facade.
//!
//! [`SyncEngine`] is the entry point embedders use. It owns the schema
//! registry, an explicit map from `(appId, tableId)` to the table's current
//! generation, and routes every row and feed operation to that generation's
//! [`TableStore`] after checking the caller's table-level permission.
//!
//! On disk every table has a pointer file naming its current generation:
//!
//! ```text
//! <root>/<appId>/<tableId>/
//!   TABLE                  # {"schemaETag": "...", "retired": [...], ...}
//!   <schemaETag>/          # one directory per generation (see crate::table)
//! ```
//!
//! A schema change writes a new generation directory and then swaps the
//! pointer; the previous generation's files are left untouched.
use std::{collections::BTreeMap, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tokio::sync::{Mutex, RwLock};

use crate::{
    access::{AccessPolicy, Caller, Principal, TablePermission},
    config::{ConfigError, EngineConfig},
    etag::{DataETag, RowETag, SchemaETag},
    feed::{ChangeSetList, RowPage},
    row::{Row, RowUpdate},
    schema::{ColumnForest, ColumnSpec, DataModel, SchemaError, get_data_model},
    storage::{self, StorageError, StorageLocation},
    table::{
        ConflictPair, ConflictResolution, ErrorKind, RowOutcomeList, TableDefinition, TableError,
        TableIdentity, TableStore, TableVersion,
    },
};

/// Errors returned by [`SyncEngine`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// An appId or tableId contains characters that cannot name a table.
    #[snafu(display("Invalid {kind} {value:?}: use letters, digits, '_' and '-'"))]
    InvalidIdentifier {
        /// `appId` or `tableId`.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// No table with this id exists.
    #[snafu(display("Table {app_id}/{table_id} not found"))]
    TableNotFound {
        /// Application.
        app_id: String,
        /// Table.
        table_id: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A table with this id exists with a different schema.
    #[snafu(display("Table {app_id}/{table_id} already exists with schemaETag {schema_etag}"))]
    TableAlreadyExists {
        /// Application.
        app_id: String,
        /// Table.
        table_id: String,
        /// Current generation of the existing table.
        schema_etag: SchemaETag,
    },

    /// The caller named a generation that is not the current one.
    #[snafu(display(
        "schemaETag mismatch on {app_id}/{table_id}: supplied {supplied}, current is {current}"
    ))]
    SchemaETagMismatch {
        /// Application.
        app_id: String,
        /// Table.
        table_id: String,
        /// schemaETag the caller supplied.
        supplied: SchemaETag,
        /// Current schemaETag.
        current: SchemaETag,
    },

    /// The principal lacks a table permission.
    #[snafu(display("{principal} lacks {permission} on {app_id}/{table_id}"))]
    PermissionDenied {
        /// Caller.
        principal: String,
        /// Missing permission.
        permission: TablePermission,
        /// Application.
        app_id: String,
        /// Table.
        table_id: String,
    },

    /// The column list does not compile.
    #[snafu(display("Invalid schema: {source}"))]
    Schema {
        /// Underlying schema error.
        #[snafu(backtrace)]
        source: SchemaError,
    },

    /// A table store operation failed.
    #[snafu(display("{source}"))]
    Table {
        /// Underlying table error.
        #[snafu(backtrace)]
        source: TableError,
    },

    /// Storage failure while reading or writing table pointers.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A table pointer file is unreadable.
    #[snafu(display("Corrupt table pointer at {location}: {msg}"))]
    CorruptPointer {
        /// Where the pointer lives.
        location: String,
        /// What is wrong.
        msg: String,
    },

    /// The configuration is invalid.
    #[snafu(display("{source}"))]
    Config {
        /// Underlying configuration error.
        source: ConfigError,
    },
}

impl EngineError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidIdentifier { .. } | EngineError::Config { .. } => {
                ErrorKind::InvalidRequest
            }
            EngineError::TableNotFound { .. } => ErrorKind::NotFound,
            EngineError::TableAlreadyExists { .. } => ErrorKind::InvalidRequest,
            EngineError::SchemaETagMismatch { .. } => ErrorKind::VersionMismatch,
            EngineError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            EngineError::Schema { .. } => ErrorKind::SchemaValidation,
            EngineError::Table { source } => source.kind(),
            EngineError::Storage { .. } => ErrorKind::StorageFailure,
            EngineError::CorruptPointer { .. } => ErrorKind::Corrupt,
        }
    }

    /// True when retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::Storage { .. } => true,
            EngineError::Table { source } => source.is_retriable(),
            _ => false,
        }
    }
}

/// Result type of engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Persisted pointer from a table id to its current generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TablePointer {
    #[serde(rename = "schemaETag")]
    schema_etag: SchemaETag,
    #[serde(default)]
    retired: Vec<SchemaETag>,
    updated_at: DateTime<Utc>,
}

/// A table and its generations.
#[derive(Clone, Debug)]
pub struct TableEntry {
    /// The generation that serves reads and writes.
    pub current: Arc<TableStore>,
    /// Earlier generations, oldest first.
    pub retired: Vec<SchemaETag>,
}

/// Map from `(appId, tableId)` to the table's generations.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<(String, String), TableEntry>,
}

impl SchemaRegistry {
    /// Entry of a table.
    pub fn get(&self, app_id: &str, table_id: &str) -> Option<&TableEntry> {
        self.tables.get(&(app_id.to_string(), table_id.to_string()))
    }

    /// Register or replace a table's entry.
    pub fn insert(&mut self, entry: TableEntry) {
        let identity = entry.current.identity();
        let key = (identity.app_id.clone(), identity.table_id.clone());
        self.tables.insert(key, entry);
    }

    /// Identities of the current generations of `app_id`'s tables, by tableId.
    pub fn tables<'a>(
        &'a self,
        app_id: &'a str,
    ) -> impl Iterator<Item = &'a TableIdentity> + 'a {
        self.tables
            .iter()
            .filter(move |((app, _), _)| app == app_id)
            .map(|(_, entry)| entry.current.identity())
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True when no table is registered.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn validate_identifier(kind: &'static str, value: &str) -> EngineResult<()> {
    ensure!(
        !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        InvalidIdentifierSnafu { kind, value }
    );
    Ok(())
}

/// The table synchronization engine.
#[derive(Debug)]
pub struct SyncEngine {
    location: StorageLocation,
    config: EngineConfig,
    policy: Arc<dyn AccessPolicy>,
    registry: RwLock<SchemaRegistry>,
    admin: Mutex<()>,
}

impl SyncEngine {
    /// Name of the per-table pointer file.
    pub const POINTER_FILE_NAME: &str = "TABLE";

    /// Open the engine over `location`, loading every table found there.
    pub async fn open(
        location: StorageLocation,
        config: EngineConfig,
        policy: Arc<dyn AccessPolicy>,
    ) -> EngineResult<Self> {
        config.validate().context(ConfigSnafu)?;

        let mut registry = SchemaRegistry::default();
        for app_id in storage::list_dir(&location, Path::new(""))
            .await
            .context(StorageSnafu)?
        {
            let app_dir = Path::new(&app_id);
            for table_id in storage::list_dir(&location, app_dir)
                .await
                .context(StorageSnafu)?
            {
                let table_location = location.child(&app_id).child(&table_id);
                let Some(pointer) = Self::read_pointer(&table_location).await? else {
                    log::warn!(
                        "skipping {app_id}/{table_id}: no {} file",
                        Self::POINTER_FILE_NAME
                    );
                    continue;
                };
                let store = TableStore::open(
                    table_location.child(pointer.schema_etag.as_str()),
                    config.clone(),
                )
                .await
                .context(TableSnafu)?;
                registry.insert(TableEntry {
                    current: Arc::new(store),
                    retired: pointer.retired,
                });
            }
        }
        log::info!("opened {} table(s) at {location}", registry.len());

        Ok(Self {
            location,
            config,
            policy,
            registry: RwLock::new(registry),
            admin: Mutex::new(()),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Storage root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    async fn read_pointer(table_location: &StorageLocation) -> EngineResult<Option<TablePointer>> {
        let json = match storage::read_to_string(table_location, Path::new(Self::POINTER_FILE_NAME))
            .await
        {
            Ok(json) => json,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(EngineError::Storage { source }),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| EngineError::CorruptPointer {
                location: table_location.to_string(),
                msg: e.to_string(),
            })
    }

    async fn write_pointer(
        table_location: &StorageLocation,
        pointer: &TablePointer,
    ) -> EngineResult<()> {
        let json = serde_json::to_vec_pretty(pointer).map_err(|e| EngineError::CorruptPointer {
            location: table_location.to_string(),
            msg: e.to_string(),
        })?;
        storage::write_atomic(table_location, Path::new(Self::POINTER_FILE_NAME), &json)
            .await
            .context(StorageSnafu)
    }

    fn table_location(&self, app_id: &str, table_id: &str) -> StorageLocation {
        self.location.child(app_id).child(table_id)
    }

    fn authorize(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
        permission: TablePermission,
    ) -> EngineResult<()> {
        ensure!(
            self.policy
                .has_permission(principal, app_id, table_id, permission),
            PermissionDeniedSnafu {
                principal: principal.id.as_str(),
                permission,
                app_id,
                table_id,
            }
        );
        Ok(())
    }

    fn caller(&self, principal: &Principal) -> Caller {
        Caller::new(principal.clone(), Arc::clone(&self.policy))
    }

    async fn current(&self, app_id: &str, table_id: &str) -> EngineResult<Arc<TableStore>> {
        let registry = self.registry.read().await;
        registry
            .get(app_id, table_id)
            .map(|entry| Arc::clone(&entry.current))
            .context(TableNotFoundSnafu { app_id, table_id })
    }

    /// The current generation, provided `table` names it.
    async fn generation(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        permission: TablePermission,
    ) -> EngineResult<Arc<TableStore>> {
        self.authorize(principal, &table.app_id, &table.table_id, permission)?;
        let store = self.current(&table.app_id, &table.table_id).await?;
        let current = &store.identity().schema_etag;
        ensure!(
            *current == table.schema_etag,
            SchemaETagMismatchSnafu {
                app_id: table.app_id.as_str(),
                table_id: table.table_id.as_str(),
                supplied: table.schema_etag.clone(),
                current: current.clone(),
            }
        );
        Ok(store)
    }

    /// Current generations of `app_id`'s tables the principal may read.
    pub async fn list_tables(&self, principal: &Principal, app_id: &str) -> Vec<TableIdentity> {
        let registry = self.registry.read().await;
        registry
            .tables(app_id)
            .filter(|t| {
                self.policy
                    .has_permission(principal, &t.app_id, &t.table_id, TablePermission::ReadRow)
            })
            .cloned()
            .collect()
    }

    /// Identity of a table's current generation.
    pub async fn table_identity(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
    ) -> EngineResult<TableIdentity> {
        self.authorize(principal, app_id, table_id, TablePermission::ReadRow)?;
        Ok(self.current(app_id, table_id).await?.identity().clone())
    }

    /// Create a table.
    ///
    /// Creating a table that already exists with the same columns returns
    /// the existing identity; different columns fail with
    /// [`EngineError::TableAlreadyExists`].
    pub async fn create_table(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> EngineResult<TableIdentity> {
        validate_identifier("appId", app_id)?;
        validate_identifier("tableId", table_id)?;
        self.authorize(principal, app_id, table_id, TablePermission::CreateTable)?;
        let forest = ColumnForest::build(columns).context(SchemaSnafu)?;

        let _admin = self.admin.lock().await;
        if let Some(entry) = self.registry.read().await.get(app_id, table_id) {
            let existing = entry.current.identity().clone();
            ensure!(
                entry.current.forest().same_columns(&forest),
                TableAlreadyExistsSnafu {
                    app_id,
                    table_id,
                    schema_etag: existing.schema_etag,
                }
            );
            return Ok(existing);
        }

        let identity = TableIdentity::new(app_id, table_id, SchemaETag::generate());
        let table_location = self.table_location(app_id, table_id);
        let store = TableStore::create(
            identity.clone(),
            forest,
            table_location.child(identity.schema_etag.as_str()),
            self.config.clone(),
        )
        .await
        .context(TableSnafu)?;
        Self::write_pointer(
            &table_location,
            &TablePointer {
                schema_etag: identity.schema_etag.clone(),
                retired: Vec::new(),
                updated_at: Utc::now(),
            },
        )
        .await?;

        self.registry.write().await.insert(TableEntry {
            current: Arc::new(store),
            retired: Vec::new(),
        });
        log::info!("created table {identity}");
        Ok(identity)
    }

    /// Replace a table's schema with a new, empty generation.
    ///
    /// `expected` must be the current schemaETag. In-flight writes to the old
    /// generation finish first; later ones fail. The old generation's rows
    /// are never touched.
    pub async fn schema_change(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
        expected: &SchemaETag,
        columns: &[ColumnSpec],
    ) -> EngineResult<TableIdentity> {
        self.authorize(principal, app_id, table_id, TablePermission::AlterTable)?;
        let forest = ColumnForest::build(columns).context(SchemaSnafu)?;

        let _admin = self.admin.lock().await;
        let (old, mut retired) = {
            let registry = self.registry.read().await;
            let entry = registry
                .get(app_id, table_id)
                .context(TableNotFoundSnafu { app_id, table_id })?;
            (Arc::clone(&entry.current), entry.retired.clone())
        };
        let old_etag = old.identity().schema_etag.clone();
        ensure!(
            old_etag == *expected,
            SchemaETagMismatchSnafu {
                app_id,
                table_id,
                supplied: expected.clone(),
                current: old_etag.clone(),
            }
        );

        let fence = old.retire().await;
        let identity = TableIdentity::new(app_id, table_id, SchemaETag::generate());
        let table_location = self.table_location(app_id, table_id);
        retired.push(old_etag);

        let created = async {
            let store = TableStore::create(
                identity.clone(),
                forest,
                table_location.child(identity.schema_etag.as_str()),
                self.config.clone(),
            )
            .await
            .context(TableSnafu)?;
            Self::write_pointer(
                &table_location,
                &TablePointer {
                    schema_etag: identity.schema_etag.clone(),
                    retired: retired.clone(),
                    updated_at: Utc::now(),
                },
            )
            .await?;
            Ok::<_, EngineError>(store)
        }
        .await;

        let store = match created {
            Ok(store) => store,
            Err(err) => {
                old.reinstate();
                return Err(err);
            }
        };
        self.registry.write().await.insert(TableEntry {
            current: Arc::new(store),
            retired,
        });
        drop(fence);
        log::info!("schema change on {app_id}/{table_id}: now {identity}");
        Ok(identity)
    }

    /// Stored definition of the current generation.
    pub async fn table_definition(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
    ) -> EngineResult<TableDefinition> {
        self.authorize(principal, app_id, table_id, TablePermission::ReadRow)?;
        Ok(self.current(app_id, table_id).await?.definition().clone())
    }

    /// Nested data model of the current generation.
    pub async fn data_model(
        &self,
        principal: &Principal,
        app_id: &str,
        table_id: &str,
    ) -> EngineResult<DataModel> {
        self.authorize(principal, app_id, table_id, TablePermission::ReadRow)?;
        Ok(get_data_model(self.current(app_id, table_id).await?.forest()))
    }

    /// Current dataETag and sequence.
    pub async fn version(
        &self,
        principal: &Principal,
        table: &TableIdentity,
    ) -> EngineResult<TableVersion> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        Ok(store.version().await)
    }

    /// One row, tombstones included.
    pub async fn get_row(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        row_id: &str,
    ) -> EngineResult<Row> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        let row = store.get_row(row_id).await.context(TableSnafu)?;
        let readable = self.caller(principal).can_access_row(
            &table.app_id,
            &table.table_id,
            crate::access::RowAction::Read,
            &row.filter_scope,
        );
        // A row the caller may not see is reported as absent.
        if !readable {
            return Err(EngineError::Table {
                source: TableError::RowNotFound {
                    row_id: row_id.to_string(),
                    backtrace: Backtrace::capture(),
                },
            });
        }
        Ok(row)
    }

    /// Live rows ordered by rowId.
    pub async fn get_rows(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> EngineResult<RowPage> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        store
            .get_rows(&self.caller(principal), cursor, limit)
            .await
            .context(TableSnafu)
    }

    /// Insert or update one row.
    pub async fn create_or_update_row(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        update: RowUpdate,
    ) -> EngineResult<Row> {
        if update.deleted {
            self.authorize(principal, &table.app_id, &table.table_id, TablePermission::DeleteRow)?;
        }
        let store = self.generation(principal, table, TablePermission::WriteRow).await?;
        store
            .create_or_update_row(&self.caller(principal), update)
            .await
            .context(TableSnafu)
    }

    /// Tombstone one row.
    pub async fn delete_row(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        row_id: &str,
        row_etag: Option<RowETag>,
    ) -> EngineResult<Row> {
        let store = self.generation(principal, table, TablePermission::DeleteRow).await?;
        store
            .delete_row(&self.caller(principal), row_id, row_etag)
            .await
            .context(TableSnafu)
    }

    /// Bulk write against an expected dataETag.
    pub async fn insert_or_update_rows(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        expected: Option<&DataETag>,
        updates: Vec<RowUpdate>,
    ) -> EngineResult<RowOutcomeList> {
        if updates.iter().any(|u| u.deleted) {
            self.authorize(principal, &table.app_id, &table.table_id, TablePermission::DeleteRow)?;
        }
        let store = self.generation(principal, table, TablePermission::WriteRow).await?;
        store
            .insert_or_update_rows(&self.caller(principal), expected, updates)
            .await
            .context(TableSnafu)
    }

    /// Settle a conflict pair.
    pub async fn resolve_conflict(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        row_id: &str,
        resolution: ConflictResolution,
    ) -> EngineResult<Row> {
        let store = self.generation(principal, table, TablePermission::WriteRow).await?;
        store
            .resolve_conflict(&self.caller(principal), row_id, resolution)
            .await
            .context(TableSnafu)
    }

    /// Pending conflict pairs.
    pub async fn conflicts(
        &self,
        principal: &Principal,
        table: &TableIdentity,
    ) -> EngineResult<Vec<ConflictPair>> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        Ok(store.conflicts())
    }

    /// Rows changed after `data_etag`.
    pub async fn get_rows_since(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        data_etag: Option<&DataETag>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> EngineResult<RowPage> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        store
            .get_rows_since(&self.caller(principal), data_etag, cursor, limit)
            .await
            .context(TableSnafu)
    }

    /// Change-set checkpoints after a point in history.
    pub async fn get_change_sets_since(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        data_etag: Option<&DataETag>,
        sequence_value: Option<u64>,
    ) -> EngineResult<ChangeSetList> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        Ok(store.get_change_sets_since(data_etag, sequence_value).await)
    }

    /// Rows of one change set.
    pub async fn get_change_set_rows(
        &self,
        principal: &Principal,
        table: &TableIdentity,
        data_etag: &DataETag,
        is_active: bool,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> EngineResult<RowPage> {
        let store = self.generation(principal, table, TablePermission::ReadRow).await?;
        store
            .get_change_set_rows(&self.caller(principal), data_etag, is_active, cursor, limit)
            .await
            .context(TableSnafu)
    }
}
