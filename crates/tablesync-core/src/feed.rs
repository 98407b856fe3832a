//! Diff / change-feed service.
//!
//! Read-only, snapshot-consistent pagination over a table's history:
//!
//! - [`TableStore::get_rows_since`]: rows changed after a dataETag, ordered by
//!   (sequence of their latest change, rowId);
//! - [`TableStore::get_change_sets_since`]: the dataETag checkpoints after a
//!   point in history;
//! - [`TableStore::get_change_set_rows`]: the rows one change set produced,
//!   live or tombstoned, ordered by rowId;
//! - [`TableStore::get_rows`]: the live rows, ordered by rowId.
//!
//! The first page of a feed pins the current ledger sequence and every cursor
//! it hands out carries that sequence. Later pages evaluate the table as of
//! the pinned sequence, so concurrent writes never shift rows between pages.
pub mod cursor;
pub(crate) mod page;

pub use cursor::{Cursor, CursorError};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    access::{Caller, RowAction},
    etag::DataETag,
    ledger::LedgerState,
    row::Row,
    table::{
        TableError, TableIdentity, TableStore,
        error::BadCursorSnafu,
    },
};

use page::{Boundary, Window};

/// Cursor attribute of the sequence-ordered feed.
pub const SEQUENCE_ATTRIBUTE: &str = "_SEQUENCE_VALUE";
/// Cursor attribute of the rowId-ordered feeds.
pub const ROW_ID_ATTRIBUTE: &str = "_ROW_ID";

/// One page of a feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPage {
    /// The table the rows belong to.
    pub table: TableIdentity,
    /// Rows of the page, in feed order.
    pub rows: Vec<Row>,
    /// dataETag of the pinned snapshot.
    #[serde(rename = "dataETag")]
    pub data_etag: Option<DataETag>,
    /// Ledger sequence of the pinned snapshot.
    pub sequence_value: u64,
    /// Reads this page again.
    pub refetch_cursor: String,
    /// Reads the page before this one.
    pub backward_cursor: String,
    /// Reads the page after this one.
    pub resume_cursor: String,
    /// Rows exist after this page.
    pub has_more_results: bool,
    /// Rows exist before this page.
    pub has_prior_results: bool,
}

/// Checkpoints after a point in history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetList {
    /// dataETags of the change sets, oldest first.
    pub change_sets: Vec<DataETag>,
    /// Current dataETag of the table.
    #[serde(rename = "dataETag")]
    pub data_etag: Option<DataETag>,
    /// Current ledger sequence; pass it back on the next call.
    pub sequence_value: u64,
}

/// Ordering key of a feed and its cursor encoding.
trait FeedKey: Ord + Clone {
    const ATTRIBUTE: &'static str;

    fn to_cursor_parts(&self) -> (String, String);

    fn from_cursor_parts(value: &str, row_id: Option<&str>) -> Result<Self, CursorError>;
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SequenceKey {
    sequence: u64,
    row_id: String,
}

impl FeedKey for SequenceKey {
    const ATTRIBUTE: &'static str = SEQUENCE_ATTRIBUTE;

    fn to_cursor_parts(&self) -> (String, String) {
        (self.sequence.to_string(), self.row_id.clone())
    }

    fn from_cursor_parts(value: &str, row_id: Option<&str>) -> Result<Self, CursorError> {
        let sequence = value.parse::<u64>().map_err(|e| CursorError::Boundary {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        let row_id = row_id.ok_or_else(|| CursorError::Boundary {
            value: value.to_string(),
            reason: "missing row id".to_string(),
        })?;
        Ok(Self {
            sequence,
            row_id: row_id.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RowIdKey(String);

impl FeedKey for RowIdKey {
    const ATTRIBUTE: &'static str = ROW_ID_ATTRIBUTE;

    fn to_cursor_parts(&self) -> (String, String) {
        (self.0.clone(), self.0.clone())
    }

    fn from_cursor_parts(value: &str, _row_id: Option<&str>) -> Result<Self, CursorError> {
        Ok(Self(value.to_string()))
    }
}

/// A decoded request position: the pinned snapshot and where to read.
struct Position<K> {
    snapshot: u64,
    boundary: Boundary<K>,
    change_set: Option<DataETag>,
}

impl TableStore {
    fn position<K: FeedKey>(
        &self,
        state: &LedgerState,
        token: Option<&str>,
        change_set: Option<&DataETag>,
    ) -> Result<Position<K>, TableError> {
        let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
            return Ok(Position {
                snapshot: state.sequence(),
                boundary: Boundary::After(None),
                change_set: change_set.cloned(),
            });
        };
        let cursor = Cursor::decode(token).context(BadCursorSnafu)?;
        cursor
            .check(self.identity(), K::ATTRIBUTE)
            .context(BadCursorSnafu)?;
        cursor.check_change_set(change_set).context(BadCursorSnafu)?;
        if cursor.snapshot_sequence > state.sequence() {
            return Err(TableError::BadCursor {
                source: CursorError::SnapshotAhead {
                    snapshot: cursor.snapshot_sequence,
                    current: state.sequence(),
                },
            });
        }
        let key = cursor
            .attribute_value
            .as_deref()
            .map(|v| K::from_cursor_parts(v, cursor.last_returned_row_id.as_deref()))
            .transpose()
            .context(BadCursorSnafu)?;
        let boundary = if cursor.is_forward_cursor {
            Boundary::After(key)
        } else {
            Boundary::Before(key)
        };
        Ok(Position {
            snapshot: cursor.snapshot_sequence,
            boundary,
            change_set: cursor.change_set,
        })
    }

    fn encode_boundary<K: FeedKey>(
        &self,
        position: &Position<K>,
        boundary: &Boundary<K>,
    ) -> String {
        let (key, is_forward_cursor) = match boundary {
            Boundary::After(key) => (key, true),
            Boundary::Before(key) => (key, false),
        };
        let (attribute_value, last_returned_row_id) = match key.as_ref().map(K::to_cursor_parts) {
            Some((value, row_id)) => (Some(value), Some(row_id)),
            None => (None, None),
        };
        let identity = self.identity();
        Cursor {
            app_id: identity.app_id.clone(),
            table_id: identity.table_id.clone(),
            schema_etag: identity.schema_etag.clone(),
            snapshot_sequence: position.snapshot,
            attribute_name: K::ATTRIBUTE.to_string(),
            attribute_value,
            last_returned_row_id,
            is_forward_cursor,
            change_set: position.change_set.clone(),
        }
        .encode()
    }

    /// Sort `items`, cut the window `position` selects and wrap it as a page.
    fn build_page<K: FeedKey>(
        &self,
        state: &LedgerState,
        position: &Position<K>,
        mut items: Vec<(K, &Row)>,
        limit: Option<usize>,
    ) -> RowPage {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<K> = items.iter().map(|(k, _)| k.clone()).collect();
        let limit = self.config().effective_fetch_limit(limit);
        let Window {
            range,
            refetch,
            backward,
            resume,
            has_more,
            has_prior,
        } = page::select(&keys, &position.boundary, limit);

        RowPage {
            table: self.identity().clone(),
            rows: items[range].iter().map(|(_, row)| (*row).clone()).collect(),
            data_etag: state.data_etag_at(position.snapshot).cloned(),
            sequence_value: position.snapshot,
            refetch_cursor: self.encode_boundary(position, &refetch),
            backward_cursor: self.encode_boundary(position, &backward),
            resume_cursor: self.encode_boundary(position, &resume),
            has_more_results: has_more,
            has_prior_results: has_prior,
        }
    }

    fn readable(&self, caller: &Caller, row: &Row) -> bool {
        let identity = self.identity();
        caller.can_access_row(
            &identity.app_id,
            &identity.table_id,
            RowAction::Read,
            &row.filter_scope,
        )
    }

    /// Sequence a client-supplied dataETag stands for; an unknown one means
    /// the client needs everything.
    fn since_sequence(&self, state: &LedgerState, data_etag: Option<&DataETag>) -> u64 {
        match data_etag {
            None => 0,
            Some(etag) => state.sequence_of(etag).unwrap_or_else(|| {
                log::warn!(
                    "unknown dataETag {etag} for {}; returning a full fetch",
                    self.identity()
                );
                0
            }),
        }
    }

    /// Rows changed after `data_etag`, tombstones included.
    ///
    /// `None` diffs against the empty table. Each changed row appears once,
    /// at its latest version within the pinned snapshot.
    pub async fn get_rows_since(
        &self,
        caller: &Caller,
        data_etag: Option<&DataETag>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<RowPage, TableError> {
        let state = self.read_state().await;
        let position = self.position::<SequenceKey>(&state, cursor, None)?;
        let since = self.since_sequence(&state, data_etag);

        let items = state
            .rows_at(position.snapshot)
            .filter(|v| v.sequence > since && self.readable(caller, &v.row))
            .map(|v| {
                let key = SequenceKey {
                    sequence: v.sequence,
                    row_id: v.row.row_id.clone(),
                };
                (key, &v.row)
            })
            .collect();
        Ok(self.build_page(&state, &position, items, limit))
    }

    /// Live rows ordered by rowId.
    pub async fn get_rows(
        &self,
        caller: &Caller,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<RowPage, TableError> {
        let state = self.read_state().await;
        let position = self.position::<RowIdKey>(&state, cursor, None)?;
        let items = state
            .rows_at(position.snapshot)
            .filter(|v| !v.row.deleted && self.readable(caller, &v.row))
            .map(|v| (RowIdKey(v.row.row_id.clone()), &v.row))
            .collect();
        Ok(self.build_page(&state, &position, items, limit))
    }

    /// dataETags of the change sets after `max(sequence of data_etag,
    /// sequence_value)`.
    pub async fn get_change_sets_since(
        &self,
        data_etag: Option<&DataETag>,
        sequence_value: Option<u64>,
    ) -> ChangeSetList {
        let state = self.read_state().await;
        let since = self
            .since_sequence(&state, data_etag)
            .max(sequence_value.unwrap_or(0));
        ChangeSetList {
            change_sets: state
                .change_sets_between(since, state.sequence())
                .iter()
                .map(|cs| cs.data_etag.clone())
                .collect(),
            data_etag: state.data_etag().cloned(),
            sequence_value: state.sequence(),
        }
    }

    /// Rows of one change set.
    ///
    /// With `is_active` the live rows whose current version that change set
    /// produced. Without it every row the change set touched: the tombstone
    /// for rows deleted since, otherwise the version the change set wrote.
    pub async fn get_change_set_rows(
        &self,
        caller: &Caller,
        data_etag: &DataETag,
        is_active: bool,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<RowPage, TableError> {
        let state = self.read_state().await;
        let position = self.position::<RowIdKey>(&state, cursor, Some(data_etag))?;

        let mut items = Vec::new();
        match state.sequence_of(data_etag) {
            None => log::warn!(
                "unknown change set {data_etag} for {}; returning no rows",
                self.identity()
            ),
            Some(sequence) if sequence > position.snapshot => {}
            Some(sequence) => {
                let touched = state
                    .change_set(sequence)
                    .map(|cs| cs.row_ids.as_slice())
                    .unwrap_or_default();
                for row_id in touched {
                    let Some(latest) = state.row_at(row_id, position.snapshot) else {
                        continue;
                    };
                    let version = if is_active {
                        Some(latest).filter(|v| !v.row.deleted && v.sequence == sequence)
                    } else if latest.row.deleted {
                        Some(latest)
                    } else {
                        state.version_written_at(row_id, sequence)
                    };
                    if let Some(version) = version.filter(|v| self.readable(caller, &v.row)) {
                        items.push((RowIdKey(row_id.clone()), &version.row));
                    }
                }
            }
        }
        Ok(self.build_page(&state, &position, items, limit))
    }
}
