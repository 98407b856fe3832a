//! Conflict pairs.
//!
//! Under [`ConflictPolicy::PreserveConflicts`](crate::config::ConflictPolicy)
//! a write that loses its compare-and-swap is not thrown away: the store keeps
//! the losing (local) content next to the stored (server) row until someone
//! resolves the pair.
use serde::{Deserialize, Serialize};

use crate::{etag::RowETag, row::Row};

/// Why a row is part of a conflict pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// The client deleted a row the server has since changed.
    LocalDeletedOldValues,
    /// The client updated a row the server has since changed or deleted.
    LocalUpdatedUpdatedValues,
    /// The server holds a tombstone the client did not know about.
    ServerDeletedOldValues,
    /// The server holds a newer version than the client's base.
    ServerUpdatedUpdatedValues,
}

impl ConflictType {
    /// Numeric code used by sync clients.
    pub fn code(self) -> u8 {
        match self {
            ConflictType::LocalDeletedOldValues => 1,
            ConflictType::LocalUpdatedUpdatedValues => 2,
            ConflictType::ServerDeletedOldValues => 3,
            ConflictType::ServerUpdatedUpdatedValues => 4,
        }
    }

    /// Tags for (local, server) given what each side did.
    pub fn classify(local_deleted: bool, server_deleted: bool) -> (ConflictType, ConflictType) {
        match (local_deleted, server_deleted) {
            (true, _) => (
                ConflictType::LocalDeletedOldValues,
                ConflictType::ServerUpdatedUpdatedValues,
            ),
            (false, true) => (
                ConflictType::LocalUpdatedUpdatedValues,
                ConflictType::ServerDeletedOldValues,
            ),
            (false, false) => (
                ConflictType::LocalUpdatedUpdatedValues,
                ConflictType::ServerUpdatedUpdatedValues,
            ),
        }
    }
}

/// One side of a conflict pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedRow {
    /// Why this side conflicts.
    pub conflict_type: ConflictType,
    /// The row content.
    pub row: Row,
}

/// A losing write held next to the row it lost against.
///
/// The local row carries the rowETag the client based its change on (empty
/// when it supplied none) and the server row's dataETag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPair {
    /// Row both sides belong to.
    pub row_id: String,
    /// The client's content.
    pub local: TaggedRow,
    /// The stored row when the conflict was detected.
    pub server: TaggedRow,
    /// Ledger sequence when the conflict was detected.
    pub detected_at_sequence: u64,
}

impl ConflictPair {
    /// Pair `local` (what the client tried to write) against `server`.
    pub fn new(local: Row, server: Row, detected_at_sequence: u64) -> Self {
        let (local_type, server_type) = ConflictType::classify(local.deleted, server.deleted);
        Self {
            row_id: server.row_id.clone(),
            local: TaggedRow {
                conflict_type: local_type,
                row: local,
            },
            server: TaggedRow {
                conflict_type: server_type,
                row: server,
            },
            detected_at_sequence,
        }
    }

    /// rowETag the client based its change on.
    pub fn local_base_etag(&self) -> &RowETag {
        &self.local.row.row_etag
    }
}

/// How to settle a conflict pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Apply the client's content on top of the server row.
    TakeLocal,
    /// Keep the server row and drop the client's content.
    TakeServer,
}
