//! Continuation tokens for the change feed.
//!
//! A cursor carries everything needed to produce the next page: the table it
//! belongs to, the ledger sequence the first page pinned, the ordering
//! attribute, the boundary key and the direction. The server keeps no
//! per-client state, so a client may hold a cursor for as long as it likes.
//!
//! On the wire a cursor is its JSON payload encoded as URL-safe base64
//! without padding.
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    etag::{DataETag, SchemaETag},
    table::TableIdentity,
};

/// Errors raised when decoding or checking a cursor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CursorError {
    /// The token is not valid base64.
    #[snafu(display("cursor is not valid base64: {source}"))]
    Encoding {
        /// Underlying decode error.
        source: base64::DecodeError,
    },

    /// The decoded bytes are not a cursor payload.
    #[snafu(display("cursor payload is malformed: {source}"))]
    Payload {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The cursor was issued for another table or generation.
    #[snafu(display("cursor belongs to {found}, not {expected}"))]
    ForeignTable {
        /// Table being read.
        expected: String,
        /// Table named by the cursor.
        found: String,
    },

    /// The cursor was issued by a different feed operation.
    #[snafu(display("cursor orders by {found}, this feed orders by {expected}"))]
    Attribute {
        /// Attribute of the feed being read.
        expected: String,
        /// Attribute named by the cursor.
        found: String,
    },

    /// The cursor pages a different change set, or none.
    #[snafu(display("cursor pages change set {found}, this request pages {expected}"))]
    ChangeSet {
        /// Change set of the request, `-` for none.
        expected: String,
        /// Change set named by the cursor, `-` for none.
        found: String,
    },

    /// The boundary value cannot be interpreted for the attribute.
    #[snafu(display("cursor boundary {value:?} is invalid: {reason}"))]
    Boundary {
        /// The offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The cursor pins a snapshot newer than the table.
    #[snafu(display("cursor snapshot {snapshot} is ahead of the table (sequence {current})"))]
    SnapshotAhead {
        /// Sequence pinned by the cursor.
        snapshot: u64,
        /// Current ledger sequence.
        current: u64,
    },
}

/// Decoded continuation token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Application of the table.
    pub app_id: String,
    /// Table id.
    pub table_id: String,
    /// Generation the cursor was issued for.
    #[serde(rename = "schemaETag")]
    pub schema_etag: SchemaETag,
    /// Ledger sequence pinned by the first page.
    pub snapshot_sequence: u64,
    /// Ordering attribute (`_SEQUENCE_VALUE` or `_ROW_ID`).
    pub attribute_name: String,
    /// Boundary value of the attribute; `None` means the start (forward) or
    /// the end (backward) of the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
    /// Row id at the boundary, breaking ties within `attribute_value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_returned_row_id: Option<String>,
    /// Read rows after the boundary (`true`) or before it (`false`).
    pub is_forward_cursor: bool,
    /// Change set paged by a `getChangeSetRows` cursor.
    #[serde(
        default,
        rename = "changeSetDataETag",
        skip_serializing_if = "Option::is_none"
    )]
    pub change_set: Option<DataETag>,
}

impl Cursor {
    /// Opaque, URL-safe token for this cursor.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a token produced by [`Cursor::encode`].
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(token.trim()).context(EncodingSnafu)?;
        serde_json::from_slice(&bytes).context(PayloadSnafu)
    }

    /// Fail unless the cursor was issued for `table` by a feed ordered by
    /// `attribute`.
    pub fn check(&self, table: &TableIdentity, attribute: &str) -> Result<(), CursorError> {
        ensure!(
            self.app_id == table.app_id
                && self.table_id == table.table_id
                && self.schema_etag == table.schema_etag,
            ForeignTableSnafu {
                expected: table.to_string(),
                found: format!("{}/{}@{}", self.app_id, self.table_id, self.schema_etag),
            }
        );
        ensure!(
            self.attribute_name == attribute,
            AttributeSnafu {
                expected: attribute,
                found: self.attribute_name.as_str(),
            }
        );
        Ok(())
    }

    /// Fail unless the cursor pages `change_set` (`None` for feeds over the
    /// whole table).
    pub fn check_change_set(&self, change_set: Option<&DataETag>) -> Result<(), CursorError> {
        let label = |etag: Option<&DataETag>| etag.map_or("-".to_string(), DataETag::to_string);
        ensure!(
            self.change_set.as_ref() == change_set,
            ChangeSetSnafu {
                expected: label(change_set),
                found: label(self.change_set.as_ref()),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableIdentity {
        TableIdentity::new("app", "visits", SchemaETag::new("uuid:s1"))
    }

    fn cursor() -> Cursor {
        Cursor {
            app_id: "app".to_string(),
            table_id: "visits".to_string(),
            schema_etag: SchemaETag::new("uuid:s1"),
            snapshot_sequence: 7,
            attribute_name: "_ROW_ID".to_string(),
            attribute_value: Some("r/10?x=1".to_string()),
            last_returned_row_id: Some("r/10?x=1".to_string()),
            is_forward_cursor: true,
            change_set: None,
        }
    }

    #[test]
    fn tokens_are_url_safe_and_decode_back() {
        let token = cursor().encode();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_eq!(Cursor::decode(&token).unwrap(), cursor());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(matches!(
            Cursor::decode("not base64!"),
            Err(CursorError::Encoding { .. })
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        assert!(matches!(
            Cursor::decode(&not_json),
            Err(CursorError::Payload { .. })
        ));
    }

    #[test]
    fn foreign_cursors_fail_the_check() {
        let cursor = cursor();
        cursor.check(&table(), "_ROW_ID").unwrap();

        let other_generation = TableIdentity::new("app", "visits", SchemaETag::new("uuid:s2"));
        assert!(matches!(
            cursor.check(&other_generation, "_ROW_ID"),
            Err(CursorError::ForeignTable { .. })
        ));
        assert!(matches!(
            cursor.check(&table(), "_SEQUENCE_VALUE"),
            Err(CursorError::Attribute { .. })
        ));
    }

    #[test]
    fn change_set_cursors_only_fit_their_change_set() {
        let d1 = DataETag::new("uuid:d1");
        let paged = Cursor {
            change_set: Some(d1.clone()),
            ..cursor()
        };
        let decoded = Cursor::decode(&paged.encode()).unwrap();
        decoded.check_change_set(Some(&d1)).unwrap();
        assert!(matches!(
            decoded.check_change_set(Some(&DataETag::new("uuid:d2"))),
            Err(CursorError::ChangeSet { .. })
        ));
        assert!(matches!(
            decoded.check_change_set(None),
            Err(CursorError::ChangeSet { .. })
        ));
        assert!(matches!(
            cursor().check_change_set(Some(&d1)),
            Err(CursorError::ChangeSet { .. })
        ));
    }
}
