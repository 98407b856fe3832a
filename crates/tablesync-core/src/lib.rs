//! Core engine for synchronized tables.
//!
//! Devices keep offline copies of tables and reconcile with a server through
//! versioned rows. This crate provides the server-side pieces:
//!
//! - A schema compiler that turns flat column lists into a validated column
//!   forest and a nested data model (`schema` module).
//! - A row model with etags, filter scopes and row-level conflict tagging
//!   (`row` module).
//! - An append-only version ledger: every committed write lands in a change
//!   set identified by a dataETag, and a monotonic sequence orders them
//!   (`ledger` module).
//! - A per-generation table store with compare-and-swap writes, bulk writes
//!   and explicit conflict pairs (`table` module).
//! - A cursor-paginated change feed over pinned snapshots (`feed` module).
//! - The [`SyncEngine`] facade that ties tables, generations and access
//!   control together (`engine` module).
//!
//! Storage goes through a small location abstraction with a local
//! filesystem backend and an in-memory one for tests (`storage` module).
#![deny(missing_docs)]
pub mod access;
pub mod config;
pub mod engine;
pub mod etag;
pub mod feed;
pub mod ledger;
pub mod row;
pub mod schema;
pub mod storage;
pub mod table;

pub use access::{AccessPolicy, AllowAll, Caller, Principal, StaticAccessPolicy, TablePermission};
pub use config::{ConflictPolicy, EngineConfig};
pub use engine::{EngineError, EngineResult, SyncEngine};
pub use etag::{DataETag, RowETag, SchemaETag};
pub use feed::{ChangeSetList, Cursor, RowPage};
pub use row::{Row, RowAccess, RowFilterScope, RowUpdate};
pub use schema::{ColumnForest, ColumnSpec, DataModel};
pub use storage::{MemoryStore, StorageLocation};
pub use table::{
    ConflictPair, ConflictResolution, ErrorKind, RowOutcomeList, RowOutcomeStatus, TableIdentity,
    TableStore,
};
