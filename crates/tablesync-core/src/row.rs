//! Row model.
//!
//! A [`Row`] is what the store keeps and what clients receive: identity, version
//! tokens, sync metadata and the values of every retained column. Values are
//! always held in canonical form, sorted by column key and covering every
//! retained column (`None` where no value was supplied), so that two rows with
//! the same content compare and serialize identically.
//!
//! Clients submit changes as a [`RowUpdate`]. The store turns an update into a
//! [`RowDraft`] (validated, canonical, no version tokens yet) and stamps the
//! draft with fresh tokens when it commits.
pub mod attachments;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    etag::{DataETag, RowETag},
    schema::ColumnForest,
};

/// Errors raised while building a row from client input.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RowError {
    /// A value was supplied for a column that is not a retained column of
    /// the table.
    #[snafu(display("Unknown column {column}"))]
    UnknownColumn {
        /// The offending column key.
        column: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The row id is empty.
    #[snafu(display("Row id must not be empty"))]
    EmptyRowId {
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Default access granted by a row's filter scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowAccess {
    /// Anyone with table access may read, modify and delete.
    #[default]
    Full,
    /// Anyone may read and modify; only owners and privileged users delete.
    Modify,
    /// Anyone may read; only owners and privileged users change.
    ReadOnly,
    /// Only owners and privileged users see the row.
    Hidden,
}

/// Row-level access tag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFilterScope {
    /// Access for principals with no special relationship to the row.
    #[serde(default)]
    pub default_access: RowAccess,
    /// Principal that owns the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_owner: Option<String>,
    /// Group granted read-only access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_read_only: Option<String>,
    /// Group granted modify access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_modify: Option<String>,
    /// Group granted full access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_privileged: Option<String>,
}

impl RowFilterScope {
    /// A scope with the given default access and no owner or groups.
    pub fn new(default_access: RowAccess) -> Self {
        Self {
            default_access,
            ..Self::default()
        }
    }

    /// Set the owner.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.row_owner = Some(owner.into());
        self
    }
}

/// Who last saved the row on the client, and how.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Savepoint {
    /// `COMPLETE` or `INCOMPLETE` in practice; kept opaque here.
    #[serde(default)]
    pub savepoint_type: Option<String>,
    /// Client timestamp of the save.
    #[serde(default)]
    pub savepoint_timestamp: Option<String>,
    /// User that saved.
    #[serde(default)]
    pub savepoint_creator: Option<String>,
}

/// One column/value pair of a row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataKeyValue {
    /// Column key.
    pub column: String,
    /// Value, `None` for null.
    pub value: Option<String>,
}

/// A stored row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Row identifier, unique within a table generation.
    pub row_id: String,
    /// Version of this row.
    #[serde(rename = "rowETag")]
    pub row_etag: RowETag,
    /// Change set that produced this version.
    #[serde(rename = "dataETagAtModification")]
    pub data_etag_at_modification: DataETag,
    /// Tombstone flag.
    pub deleted: bool,
    /// Form used to edit the row on the client.
    #[serde(default)]
    pub form_id: Option<String>,
    /// Client locale.
    #[serde(default)]
    pub locale: Option<String>,
    /// Client save metadata.
    #[serde(flatten)]
    pub savepoint: Savepoint,
    /// Row-level access tag.
    #[serde(default)]
    pub filter_scope: RowFilterScope,
    /// Canonical values, sorted by column key.
    pub ordered_columns: Vec<DataKeyValue>,
    /// Non-null values of the attachment columns, in declared column order.
    #[serde(default)]
    pub uri_fragments: Vec<String>,
}

impl Row {
    /// Value of `column`, `None` when null or not a column of the row.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.ordered_columns
            .binary_search_by(|kv| kv.column.as_str().cmp(column))
            .ok()
            .and_then(|idx| self.ordered_columns[idx].value.as_deref())
    }

    /// Values as a map.
    pub fn values(&self) -> BTreeMap<String, Option<String>> {
        self.ordered_columns
            .iter()
            .map(|kv| (kv.column.clone(), kv.value.clone()))
            .collect()
    }

    /// True when `draft` carries exactly the content of this row, ignoring
    /// version tokens.
    pub fn has_matching_significant_fields(&self, draft: &RowDraft) -> bool {
        self.row_id == draft.row_id
            && self.deleted == draft.deleted
            && self.form_id == draft.form_id
            && self.locale == draft.locale
            && self.savepoint == draft.savepoint
            && self.filter_scope == draft.filter_scope
            && self.ordered_columns == draft.ordered_columns
    }

    /// This row's content as a draft, e.g. to re-submit it.
    pub fn to_draft(&self) -> RowDraft {
        RowDraft {
            row_id: self.row_id.clone(),
            deleted: self.deleted,
            form_id: self.form_id.clone(),
            locale: self.locale.clone(),
            savepoint: self.savepoint.clone(),
            filter_scope: self.filter_scope.clone(),
            ordered_columns: self.ordered_columns.clone(),
            uri_fragments: self.uri_fragments.clone(),
        }
    }

    /// This row as a client update carrying its own rowETag.
    pub fn to_update(&self) -> RowUpdate {
        RowUpdate {
            row_id: Some(self.row_id.clone()),
            row_etag: Some(self.row_etag.clone()),
            deleted: self.deleted,
            form_id: self.form_id.clone(),
            locale: self.locale.clone(),
            savepoint: self.savepoint.clone(),
            filter_scope: Some(self.filter_scope.clone()),
            values: self.values(),
        }
    }
}

/// A change submitted by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowUpdate {
    /// Target row; on insert `None` lets the store allocate one.
    #[serde(default)]
    pub row_id: Option<String>,
    /// The rowETag the client last saw; `None` for an insert.
    #[serde(rename = "rowETag", default)]
    pub row_etag: Option<RowETag>,
    /// Request deletion (bulk submissions only).
    #[serde(default)]
    pub deleted: bool,
    /// Form used on the client.
    #[serde(default)]
    pub form_id: Option<String>,
    /// Client locale.
    #[serde(default)]
    pub locale: Option<String>,
    /// Client save metadata.
    #[serde(flatten)]
    pub savepoint: Savepoint,
    /// New filter scope; `None` keeps the stored row's scope.
    #[serde(default)]
    pub filter_scope: Option<RowFilterScope>,
    /// New values by column key.
    #[serde(default)]
    pub values: BTreeMap<String, Option<String>>,
}

impl RowUpdate {
    /// An update for `row_id` with no values yet.
    pub fn new(row_id: impl Into<String>) -> Self {
        Self {
            row_id: Some(row_id.into()),
            ..Self::default()
        }
    }

    /// Set the rowETag the client last saw.
    pub fn with_etag(mut self, row_etag: RowETag) -> Self {
        self.row_etag = Some(row_etag);
        self
    }

    /// Set a column value.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(column.into(), Some(value.into()));
        self
    }

    /// Set a column to null.
    pub fn null(mut self, column: impl Into<String>) -> Self {
        self.values.insert(column.into(), None);
        self
    }

    /// Set the filter scope.
    pub fn with_filter_scope(mut self, scope: RowFilterScope) -> Self {
        self.filter_scope = Some(scope);
        self
    }
}

/// Validated, canonical row content awaiting version tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowDraft {
    /// Row identifier.
    pub row_id: String,
    /// Tombstone flag.
    pub deleted: bool,
    /// Form used on the client.
    pub form_id: Option<String>,
    /// Client locale.
    pub locale: Option<String>,
    /// Client save metadata.
    pub savepoint: Savepoint,
    /// Effective filter scope.
    pub filter_scope: RowFilterScope,
    /// Canonical values.
    pub ordered_columns: Vec<DataKeyValue>,
    /// Derived attachment fragments.
    pub uri_fragments: Vec<String>,
}

impl RowDraft {
    /// Validate `update` against `forest` and canonicalize its values.
    ///
    /// `previous` is the stored row, if any; its filter scope is kept when the
    /// update does not carry one.
    pub fn from_update(
        row_id: &str,
        update: &RowUpdate,
        forest: &ColumnForest,
        previous: Option<&Row>,
    ) -> Result<Self, RowError> {
        ensure!(!row_id.is_empty(), EmptyRowIdSnafu);
        let ordered_columns = canonical_values(forest, &update.values)?;
        let uri_fragments = attachments::uri_fragments(forest, &ordered_columns);
        let filter_scope = match (&update.filter_scope, previous) {
            (Some(scope), _) => scope.clone(),
            (None, Some(prev)) => prev.filter_scope.clone(),
            (None, None) => RowFilterScope::default(),
        };
        Ok(Self {
            row_id: row_id.to_string(),
            deleted: false,
            form_id: update.form_id.clone(),
            locale: update.locale.clone(),
            savepoint: update.savepoint.clone(),
            filter_scope,
            ordered_columns,
            uri_fragments,
        })
    }

    /// The tombstone of `row`: same content, `deleted` set.
    pub fn tombstone_of(row: &Row) -> Self {
        let mut draft = row.to_draft();
        draft.deleted = true;
        draft
    }

    /// Attach version tokens.
    pub fn stamp(self, row_etag: RowETag, data_etag: DataETag) -> Row {
        Row {
            row_id: self.row_id,
            row_etag,
            data_etag_at_modification: data_etag,
            deleted: self.deleted,
            form_id: self.form_id,
            locale: self.locale,
            savepoint: self.savepoint,
            filter_scope: self.filter_scope,
            ordered_columns: self.ordered_columns,
            uri_fragments: self.uri_fragments,
        }
    }
}

/// Canonical value list: one entry per retained column, sorted by key.
pub fn canonical_values(
    forest: &ColumnForest,
    values: &BTreeMap<String, Option<String>>,
) -> Result<Vec<DataKeyValue>, RowError> {
    if let Some(unknown) = values.keys().find(|k| !forest.is_retained(k)) {
        return UnknownColumnSnafu {
            column: unknown.as_str(),
        }
        .fail();
    }
    Ok(forest
        .retention_columns()
        .map(|def| DataKeyValue {
            column: def.element_key().to_string(),
            value: values.get(def.element_key()).cloned().flatten(),
        })
        .collect())
}
