//! Change-set payloads stored in the ledger.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    etag::{DataETag, RowETag},
    row::Row,
};

/// One row version written by a change set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    /// The row as committed.
    pub row: Row,
    /// rowETag of the version this one replaced; `None` for an insert.
    pub previous_row_etag: Option<RowETag>,
    /// Principal that made the change, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A committed ledger entry.
///
/// Example:
///
/// ```json
/// {
///   "sequence": 2,
///   "base_sequence": 1,
///   "data_etag": "uuid:8c0e…",
///   "timestamp": "2025-01-01T00:00:00Z",
///   "entries": [ { "row": { "rowId": "r1", … }, "previous_row_etag": "uuid:41aa…" } ]
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Sequence number of this change set; the first is 1.
    pub sequence: u64,
    /// Sequence the writer observed before committing.
    pub base_sequence: u64,
    /// The table's dataETag after this change set.
    pub data_etag: DataETag,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// Row versions written, one per row.
    pub entries: Vec<RowRecord>,
}

impl ChangeSet {
    /// Summary kept in memory for every change set.
    pub fn summary(&self) -> ChangeSetSummary {
        ChangeSetSummary {
            sequence: self.sequence,
            data_etag: self.data_etag.clone(),
            timestamp: self.timestamp,
            row_ids: self.entries.iter().map(|e| e.row.row_id.clone()).collect(),
        }
    }
}

/// What the ledger remembers about a change set without its rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetSummary {
    /// Sequence number.
    pub sequence: u64,
    /// dataETag produced.
    pub data_etag: DataETag,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// Rows touched, in commit order.
    pub row_ids: Vec<String>,
}
