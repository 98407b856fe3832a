//! Schema compiler.
//!
//! Table definitions arrive as a flat list of [`ColumnSpec`]s. Each spec names
//! its children by elementKey and carries a compact type string such as
//! `integer`, `geopoint`, `mytype:object` or `string(64)`. Compilation turns
//! that list into a [`ColumnForest`]:
//!
//! 1. every type string is parsed ([`ElementType::parse`]);
//! 2. children are linked to parents in an index arena, enforcing the
//!    `parent_child` naming convention and single parentage;
//! 3. array arity is checked (exactly one child);
//! 4. retention is computed: which columns are stored as their own field and
//!    which are folded into an ancestor's serialized value.
//!
//! Compilation is all-or-nothing: any violation yields a [`SchemaError`] and no
//! partial forest is observable. The compiled forest is immutable; a new
//! schema always means a new table generation.
pub mod column_definition;
pub mod data_model;
pub mod element_type;

pub use column_definition::{ColumnDefinition, ColumnForest, ColumnSpec};
pub use data_model::{DataModel, DataModelNode};
pub use element_type::{ElementDataType, ElementType, ParseElementTypeError};

use snafu::{Backtrace, prelude::*};

/// Errors raised while compiling or querying a column forest.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// A column was supplied without an elementKey.
    #[snafu(display("Column has an empty elementKey"))]
    EmptyElementKey {
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A column was supplied without an elementName.
    #[snafu(display("Column {element_key} has an empty elementName"))]
    EmptyElementName {
        /// Offending column.
        element_key: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Two columns share one elementKey.
    #[snafu(display("Duplicate elementKey {element_key}"))]
    DuplicateElementKey {
        /// The repeated key.
        element_key: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A column's type string is malformed or inconsistent with its children.
    #[snafu(display("Column {element_key} has invalid elementType {element_type:?}: {source}"))]
    InvalidElementType {
        /// Offending column.
        element_key: String,
        /// The type string as supplied.
        element_type: String,
        /// What is wrong with it.
        source: ParseElementTypeError,
    },

    /// A parent lists a child elementKey that no column defines.
    #[snafu(display("Column {parent} lists undefined child {child}"))]
    UndefinedChild {
        /// The listing parent.
        parent: String,
        /// The missing child key.
        child: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A child is claimed by more than one parent (or twice by one parent).
    #[snafu(display("Column {child} is listed as a child of both {first_parent} and {second_parent}"))]
    MultipleParents {
        /// The contested child.
        child: String,
        /// The parent that claimed it first.
        first_parent: String,
        /// The parent that claimed it again.
        second_parent: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A child's elementKey is not `<parent elementKey>_<child elementName>`.
    #[snafu(display("Column {child} under {parent} should have elementKey {expected}"))]
    NamingConvention {
        /// The parent column.
        parent: String,
        /// The child as supplied.
        child: String,
        /// The key the child must have.
        expected: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// An array column does not have exactly one child.
    #[snafu(display("Array column {element_key} must have exactly one child, found {children}"))]
    ArrayArity {
        /// The array column.
        element_key: String,
        /// How many children it has.
        children: usize,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Lookup of an elementKey that is not in the forest.
    #[snafu(display("Column {element_key} not found"))]
    ColumnNotFound {
        /// The key that was looked up.
        element_key: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Compile a flat column list into a validated forest sorted by elementKey.
pub fn build_column_definitions(columns: &[ColumnSpec]) -> Result<ColumnForest, SchemaError> {
    ColumnForest::build(columns)
}

/// Binary-search `forest` for `element_key`.
pub fn find<'a>(
    forest: &'a ColumnForest,
    element_key: &str,
) -> Result<&'a ColumnDefinition, SchemaError> {
    forest.find(element_key)
}

/// Project the forest into a nested data model keyed by root elementName.
pub fn get_data_model(forest: &ColumnForest) -> DataModel {
    data_model::project(forest)
}
