//! Compact element type strings.
//!
//! Grammar: `name[:dataType][(auxInfo)]`.
//!
//! - `auxInfo`, when present, is everything between the first `(` and a
//!   mandatory trailing `)`.
//! - `:dataType` must come before any parenthesis and names the storage type
//!   explicitly.
//! - Without an explicit data type, a `name` that is itself a primitive
//!   (`integer`, `array`, ...) implies that primitive; any other name means
//!   `object` when the column has children and `string` otherwise.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Storage-level data types a column may have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementDataType {
    /// Ordered list; exactly one child describes the items.
    Array,
    /// Boolean.
    Bool,
    /// Path relative to the application configuration directory.
    Configpath,
    /// Integer.
    Integer,
    /// Floating point number.
    Number,
    /// Composite value whose fields are the children.
    Object,
    /// Path of a file attached to the row.
    Rowpath,
    /// Text.
    String,
}

impl ElementDataType {
    /// Every data type, in name order.
    pub const ALL: [ElementDataType; 8] = [
        ElementDataType::Array,
        ElementDataType::Bool,
        ElementDataType::Configpath,
        ElementDataType::Integer,
        ElementDataType::Number,
        ElementDataType::Object,
        ElementDataType::Rowpath,
        ElementDataType::String,
    ];

    /// Name used in type strings.
    pub fn name(self) -> &'static str {
        match self {
            ElementDataType::Array => "array",
            ElementDataType::Bool => "bool",
            ElementDataType::Configpath => "configpath",
            ElementDataType::Integer => "integer",
            ElementDataType::Number => "number",
            ElementDataType::Object => "object",
            ElementDataType::Rowpath => "rowpath",
            ElementDataType::String => "string",
        }
    }

    /// Look a data type up by its exact name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.name() == name)
    }

    /// True for `array` and `object`, the types that require children.
    pub fn is_composite(self) -> bool {
        matches!(self, ElementDataType::Array | ElementDataType::Object)
    }

    /// Type name used when the column is mirrored into a JSON-style data
    /// model. Path types are plain strings there.
    pub fn model_type(self) -> &'static str {
        match self {
            ElementDataType::Configpath | ElementDataType::Rowpath => "string",
            other => other.name(),
        }
    }
}

impl fmt::Display for ElementDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementDataType {
    type Err = ParseElementTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).context(UnknownDataTypeSnafu { data_type: s })
    }
}

/// Errors from parsing an element type string.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseElementTypeError {
    /// Type string (or its name part) is empty.
    #[snafu(display("type name is empty"))]
    EmptyTypeName,

    /// A `(` is present but the string does not end with `)`.
    #[snafu(display("auxInfo must be a trailing parenthesized suffix"))]
    UnterminatedAuxInfo,

    /// Explicit `:dataType` is not a known data type.
    #[snafu(display("unknown data type {data_type:?}"))]
    UnknownDataType {
        /// The unrecognized name.
        data_type: String,
    },

    /// The name is a primitive that disagrees with the explicit data type.
    #[snafu(display("type name {type_name} implies {implied} but {explicit} was given"))]
    ConflictingDataType {
        /// Name part of the type string.
        type_name: String,
        /// Primitive implied by the name.
        implied: ElementDataType,
        /// Explicit data type.
        explicit: ElementDataType,
    },

    /// An `array` or `object` column has no children.
    #[snafu(display("{data_type} column must have children"))]
    MissingChildren {
        /// Resolved data type.
        data_type: ElementDataType,
    },

    /// A scalar column has children.
    #[snafu(display("{data_type} column cannot have children"))]
    UnexpectedChildren {
        /// Resolved data type.
        data_type: ElementDataType,
    },
}

/// A parsed element type string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementType {
    raw: String,
    type_name: String,
    data_type: ElementDataType,
    aux_info: Option<String>,
}

impl ElementType {
    /// Parse `element_type` for a column that does (or does not) have children.
    pub fn parse(element_type: &str, has_children: bool) -> Result<Self, ParseElementTypeError> {
        let (base, aux_info) = match element_type.find('(') {
            Some(open) => {
                ensure!(element_type.ends_with(')'), UnterminatedAuxInfoSnafu);
                let aux = &element_type[open + 1..element_type.len() - 1];
                (&element_type[..open], Some(aux.to_string()))
            }
            None => (element_type, None),
        };

        let (type_name, explicit) = match base.split_once(':') {
            Some((name, dt)) => (name, Some(dt.parse::<ElementDataType>()?)),
            None => (base, None),
        };
        ensure!(!type_name.is_empty(), EmptyTypeNameSnafu);

        let implied = ElementDataType::from_name(type_name);
        let data_type = match (implied, explicit) {
            (Some(implied), Some(explicit)) if implied != explicit => {
                return ConflictingDataTypeSnafu {
                    type_name,
                    implied,
                    explicit,
                }
                .fail();
            }
            (_, Some(explicit)) => explicit,
            (Some(implied), None) => implied,
            (None, None) if has_children => ElementDataType::Object,
            (None, None) => ElementDataType::String,
        };

        if data_type.is_composite() {
            ensure!(has_children, MissingChildrenSnafu { data_type });
        } else {
            ensure!(!has_children, UnexpectedChildrenSnafu { data_type });
        }

        Ok(Self {
            raw: element_type.to_string(),
            type_name: type_name.to_string(),
            data_type,
            aux_info,
        })
    }

    /// The type string exactly as supplied.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The name part (before any `:` or `(`).
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The resolved storage type.
    pub fn data_type(&self) -> ElementDataType {
        self.data_type
    }

    /// The parenthesized suffix, if any.
    pub fn aux_info(&self) -> Option<&str> {
        self.aux_info.as_deref()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
