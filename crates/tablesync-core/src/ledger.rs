//! Version ledger of a table generation.
//!
//! Every committed write becomes one [`ChangeSet`]: the rows it produced, the
//! new dataETag, and a sequence number. Change sets are stored as an
//! append-only log of JSON files plus a `CURRENT` pointer:
//!
//! ```text
//! <generation root>/
//!   _sync_log/
//!     CURRENT                  # latest published sequence (e.g. "3\n")
//!     0000000001.json          # change set 1
//!     0000000002.json          # change set 2
//!     0000000003.json          # change set 3
//! ```
//!
//! A change set file is created with create-new semantics, so each sequence
//! number is written at most once. It becomes visible only when `CURRENT` is
//! atomically advanced to it; a file beyond `CURRENT` is a pending change left
//! by an interrupted commit and is reverted when the generation is opened.
//!
//! [`LedgerState`] is the in-memory materialization of the log: current rows
//! (tombstones included), every row version by sequence, and the dataETag of
//! every change set. The change feed reads from it.
pub mod change_set;
pub mod ledger_state;
pub mod log_store;

pub use change_set::{ChangeSet, ChangeSetSummary, RowRecord};
pub use ledger_state::LedgerState;
pub use log_store::LedgerStore;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the ledger.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LedgerError {
    /// The caller's expected sequence does not match the CURRENT pointer.
    #[snafu(display("Ledger conflict: expected sequence {expected}, but CURRENT is {found}"))]
    Conflict {
        /// The sequence the caller expected to be current.
        expected: u64,
        /// The actual current sequence.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log or CURRENT file.
    #[snafu(display("Storage error while accessing the ledger: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log or CURRENT file is in an unexpected or malformed state.
    #[snafu(display("Corrupt ledger state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}
