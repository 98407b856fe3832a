//! Nested data model projected from a column forest.
//!
//! Clients mirror a table's schema as a JSON-schema-like tree: arrays carry
//! their single child under `items`, objects carry their children under
//! `properties` keyed by elementName, and scalars are leaves.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::schema::{ColumnDefinition, ColumnForest, ElementDataType};

/// Root columns keyed by elementName.
pub type DataModel = BTreeMap<String, DataModelNode>;

/// One node of the projected data model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DataModelNode {
    /// List whose items are described by `items`.
    Array {
        /// Type string when it is more specific than `array`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
        /// Description of every item.
        items: Box<DataModelNode>,
    },
    /// Composite value.
    Object {
        /// Type string when it is more specific than `object`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
        /// Children keyed by elementName.
        properties: BTreeMap<String, DataModelNode>,
    },
    /// Boolean leaf.
    Bool {
        /// Type string when it is more specific than `bool`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
    },
    /// Integer leaf.
    Integer {
        /// Type string when it is more specific than `integer`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
    },
    /// Number leaf.
    Number {
        /// Type string when it is more specific than `number`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
    },
    /// String leaf, including path types.
    String {
        /// Type string when it is more specific than `string`.
        #[serde(skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
        /// Key of the column.
        element_key: String,
    },
}

impl DataModelNode {
    /// Key of the column this node was projected from.
    pub fn element_key(&self) -> &str {
        match self {
            DataModelNode::Array { element_key, .. }
            | DataModelNode::Object { element_key, .. }
            | DataModelNode::Bool { element_key, .. }
            | DataModelNode::Integer { element_key, .. }
            | DataModelNode::Number { element_key, .. }
            | DataModelNode::String { element_key, .. } => element_key,
        }
    }
}

pub(crate) fn project(forest: &ColumnForest) -> DataModel {
    forest
        .roots()
        .map(|root| (root.element_name().to_string(), node(forest, root)))
        .collect()
}

fn node(forest: &ColumnForest, def: &ColumnDefinition) -> DataModelNode {
    let data_type = def.data_type();
    let element_type = (def.element_type().as_str() != data_type.model_type())
        .then(|| def.element_type().as_str().to_string());
    let element_key = def.element_key().to_string();

    match data_type {
        ElementDataType::Array => {
            // Arity is validated at build time; an empty arena slot cannot occur.
            let items = forest
                .children(def)
                .next()
                .map(|child| node(forest, child))
                .unwrap_or(DataModelNode::String {
                    element_type: None,
                    element_key: format!("{element_key}_items"),
                });
            DataModelNode::Array {
                element_type,
                element_key,
                items: Box::new(items),
            }
        }
        ElementDataType::Object => DataModelNode::Object {
            element_type,
            element_key,
            properties: forest
                .children(def)
                .map(|child| (child.element_name().to_string(), node(forest, child)))
                .collect(),
        },
        ElementDataType::Bool => DataModelNode::Bool {
            element_type,
            element_key,
        },
        ElementDataType::Integer => DataModelNode::Integer {
            element_type,
            element_key,
        },
        ElementDataType::Number => DataModelNode::Number {
            element_type,
            element_key,
        },
        ElementDataType::Configpath | ElementDataType::Rowpath | ElementDataType::String => {
            DataModelNode::String {
                element_type,
                element_key,
            }
        }
    }
}
