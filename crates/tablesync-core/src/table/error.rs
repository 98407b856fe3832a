//! Error types for table store operations.
use std::fmt;

use snafu::{Backtrace, prelude::*};

use crate::{
    access::RowAction,
    etag::{DataETag, RowETag, SchemaETag},
    feed::CursorError,
    ledger::LedgerError,
    row::RowError,
    schema::SchemaError,
    storage::StorageError,
    table::ConflictPair,
};

/// Coarse classification of failures, shared by every layer above storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The column list does not compile.
    SchemaValidation,
    /// A supplied rowETag, dataETag or schemaETag is stale.
    VersionMismatch,
    /// The row is held in a conflict pair.
    Conflict,
    /// A table, row or conflict does not exist.
    NotFound,
    /// A cursor could not be decoded or belongs elsewhere.
    BadCursor,
    /// The principal lacks a permission.
    PermissionDenied,
    /// The storage collaborator failed; retrying may help.
    StorageFailure,
    /// A row lock was not acquired in time; retrying may help.
    LockTimeout,
    /// The request itself is malformed.
    InvalidRequest,
    /// Persisted state is unreadable.
    Corrupt,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) fn etag_or_none<T: fmt::Display>(etag: &Option<T>) -> String {
    etag.as_ref()
        .map_or_else(|| "<none>".to_string(), ToString::to_string)
}

/// Errors returned by [`TableStore`](crate::table::TableStore).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// The supplied rowETag is not the row's current one.
    #[snafu(display(
        "Version mismatch on row {row_id}: supplied {}, current is {current}",
        etag_or_none(supplied)
    ))]
    VersionMismatch {
        /// Row written.
        row_id: String,
        /// rowETag the caller supplied.
        supplied: Option<RowETag>,
        /// rowETag currently stored.
        current: RowETag,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The row is held in a conflict pair until it is resolved.
    #[snafu(display("Row {row_id} is in conflict"))]
    RowInConflict {
        /// Row written.
        row_id: String,
        /// The pair holding the row.
        pair: Box<ConflictPair>,
    },

    /// No row with this id exists in the generation.
    #[snafu(display("Row {row_id} not found"))]
    RowNotFound {
        /// Row requested.
        row_id: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Resolution was requested for a row that is not in conflict.
    #[snafu(display("Row {row_id} has no pending conflict"))]
    NoConflict {
        /// Row requested.
        row_id: String,
    },

    /// A bulk write was based on a stale dataETag.
    #[snafu(display(
        "dataETag mismatch: expected {}, current is {}",
        etag_or_none(expected),
        etag_or_none(current)
    ))]
    DataETagMismatch {
        /// dataETag the caller supplied.
        expected: Option<DataETag>,
        /// dataETag of the table.
        current: Option<DataETag>,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The generation was replaced by a schema change.
    #[snafu(display("Table generation {schema_etag} has been retired by a schema change"))]
    GenerationRetired {
        /// schemaETag of the retired generation.
        schema_etag: SchemaETag,
    },

    /// A generation with this schemaETag already exists.
    #[snafu(display("Table generation {schema_etag} already exists"))]
    GenerationExists {
        /// The colliding schemaETag.
        schema_etag: SchemaETag,
    },

    /// The row lock was not acquired in time.
    #[snafu(display("Timed out waiting for the lock on row {row_id}"))]
    LockTimeout {
        /// Row whose lock was contended.
        row_id: String,
    },

    /// The row's filter scope does not allow the action.
    #[snafu(display("{principal} may not {action} row {row_id}"))]
    RowPermissionDenied {
        /// Caller.
        principal: String,
        /// Attempted action.
        action: RowAction,
        /// Row concerned.
        row_id: String,
    },

    /// Client row content is invalid.
    #[snafu(display("Invalid row: {source}"))]
    Row {
        /// Underlying row error.
        #[snafu(backtrace)]
        source: RowError,
    },

    /// The stored definition does not compile.
    #[snafu(display("Stored table definition is invalid: {source}"))]
    Schema {
        /// Underlying schema error.
        #[snafu(backtrace)]
        source: SchemaError,
    },

    /// The stored definition file is unreadable.
    #[snafu(display("Corrupt table definition at {location}: {msg}"))]
    CorruptDefinition {
        /// Where the definition lives.
        location: String,
        /// What is wrong.
        msg: String,
    },

    /// Storage failure outside the ledger.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Ledger failure.
    #[snafu(display("Ledger error: {source}"))]
    Ledger {
        /// Underlying ledger error.
        #[snafu(backtrace)]
        source: LedgerError,
    },

    /// The cursor was rejected.
    #[snafu(display("Bad cursor: {source}"))]
    BadCursor {
        /// Why the cursor was rejected.
        source: CursorError,
    },
}

impl TableError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TableError::VersionMismatch { .. }
            | TableError::DataETagMismatch { .. }
            | TableError::GenerationRetired { .. } => ErrorKind::VersionMismatch,
            TableError::RowInConflict { .. } => ErrorKind::Conflict,
            TableError::RowNotFound { .. } | TableError::NoConflict { .. } => ErrorKind::NotFound,
            TableError::GenerationExists { .. } | TableError::Row { .. } => {
                ErrorKind::InvalidRequest
            }
            TableError::LockTimeout { .. } => ErrorKind::LockTimeout,
            TableError::RowPermissionDenied { .. } => ErrorKind::PermissionDenied,
            TableError::Schema { .. }
            | TableError::CorruptDefinition { .. }
            | TableError::Ledger {
                source: LedgerError::CorruptState { .. },
            } => ErrorKind::Corrupt,
            TableError::Storage { .. } | TableError::Ledger { .. } => ErrorKind::StorageFailure,
            TableError::BadCursor { .. } => ErrorKind::BadCursor,
        }
    }

    /// True for failures a caller may simply retry: storage errors, lost
    /// ledger races and lock timeouts.
    pub fn is_retriable(&self) -> bool {
        match self {
            TableError::Storage { .. } | TableError::LockTimeout { .. } => true,
            TableError::Ledger { source } => matches!(
                source,
                LedgerError::Storage { .. } | LedgerError::Conflict { .. }
            ),
            _ => false,
        }
    }
}
