//! Column forest: linking, validation and retention.
//!
//! The forest is an arena. Definitions are stored sorted by elementKey and
//! refer to each other by index: a parent holds the ordered indices of its
//! children and every child holds the index of its parent. Construction runs
//! in two passes (allocate every definition, then link) so no definition ever
//! needs a reference to one that does not exist yet.
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::schema::{
    ArrayAritySnafu, ColumnNotFoundSnafu, DuplicateElementKeySnafu, ElementDataType, ElementType,
    EmptyElementKeySnafu, EmptyElementNameSnafu, InvalidElementTypeSnafu, MultipleParentsSnafu,
    NamingConventionSnafu, SchemaError, UndefinedChildSnafu,
};

/// One column as supplied by a table-creation caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    /// Unique key; for nested columns `<parent key>_<element name>`.
    pub element_key: String,
    /// Name relative to the parent.
    pub element_name: String,
    /// Compact type string, see [`ElementType`].
    pub element_type: String,
    /// Keys of the children, in order.
    #[serde(default)]
    pub list_child_element_keys: Vec<String>,
}

impl ColumnSpec {
    /// A column whose key and name are both `element_key`.
    pub fn new(element_key: impl Into<String>, element_type: impl Into<String>) -> Self {
        let element_key = element_key.into();
        Self {
            element_name: element_key.clone(),
            element_key,
            element_type: element_type.into(),
            list_child_element_keys: Vec::new(),
        }
    }

    /// A nested column: the key is derived from `parent_key` and `element_name`.
    pub fn nested(
        parent_key: &str,
        element_name: impl Into<String>,
        element_type: impl Into<String>,
    ) -> Self {
        let element_name = element_name.into();
        Self {
            element_key: format!("{parent_key}_{element_name}"),
            element_name,
            element_type: element_type.into(),
            list_child_element_keys: Vec::new(),
        }
    }

    /// Replace the child list.
    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.list_child_element_keys = children.into_iter().map(Into::into).collect();
        self
    }
}

/// A compiled column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDefinition {
    element_key: String,
    element_name: String,
    element_type: ElementType,
    parent: Option<usize>,
    children: Vec<usize>,
    unit_of_retention: bool,
}

impl ColumnDefinition {
    /// Unique key of the column.
    pub fn element_key(&self) -> &str {
        &self.element_key
    }

    /// Name relative to the parent.
    pub fn element_name(&self) -> &str {
        &self.element_name
    }

    /// Parsed type.
    pub fn element_type(&self) -> &ElementType {
        &self.element_type
    }

    /// Resolved storage type.
    pub fn data_type(&self) -> ElementDataType {
        self.element_type.data_type()
    }

    /// Parenthesized suffix of the type string.
    pub fn aux_info(&self) -> Option<&str> {
        self.element_type.aux_info()
    }

    /// Arena index of the parent, `None` for roots.
    pub fn parent_index(&self) -> Option<usize> {
        self.parent
    }

    /// Arena indices of the children, in declared order.
    pub fn child_indices(&self) -> &[usize] {
        &self.children
    }

    /// Whether the column is stored as its own physical field.
    pub fn is_unit_of_retention(&self) -> bool {
        self.unit_of_retention
    }
}

/// Validated column forest, sorted by elementKey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnForest {
    defs: Vec<ColumnDefinition>,
    /// Arena indices in the order the columns were declared.
    declared: Vec<usize>,
}

impl ColumnForest {
    /// Compile `columns`. See the [module docs](crate::schema).
    pub fn build(columns: &[ColumnSpec]) -> Result<Self, SchemaError> {
        let mut order: Vec<usize> = (0..columns.len()).collect();
        order.sort_by(|&a, &b| columns[a].element_key.cmp(&columns[b].element_key));
        let specs: Vec<&ColumnSpec> = order.iter().map(|&i| &columns[i]).collect();

        for pair in specs.windows(2) {
            ensure!(
                pair[0].element_key != pair[1].element_key,
                DuplicateElementKeySnafu {
                    element_key: pair[0].element_key.as_str(),
                }
            );
        }

        // Pass 1: allocate one definition per spec, indices follow sort order.
        let mut defs = Vec::with_capacity(specs.len());
        for spec in &specs {
            ensure!(!spec.element_key.is_empty(), EmptyElementKeySnafu);
            ensure!(
                !spec.element_name.is_empty(),
                EmptyElementNameSnafu {
                    element_key: spec.element_key.as_str(),
                }
            );
            let element_type = ElementType::parse(
                &spec.element_type,
                !spec.list_child_element_keys.is_empty(),
            )
            .context(InvalidElementTypeSnafu {
                element_key: spec.element_key.as_str(),
                element_type: spec.element_type.as_str(),
            })?;
            defs.push(ColumnDefinition {
                element_key: spec.element_key.clone(),
                element_name: spec.element_name.clone(),
                element_type,
                parent: None,
                children: Vec::with_capacity(spec.list_child_element_keys.len()),
                unit_of_retention: true,
            });
        }

        // Pass 2: link children to parents.
        for (parent_idx, spec) in specs.iter().enumerate() {
            for child_key in &spec.list_child_element_keys {
                let child_idx = specs
                    .binary_search_by(|s| s.element_key.as_str().cmp(child_key.as_str()))
                    .ok()
                    .context(UndefinedChildSnafu {
                        parent: spec.element_key.as_str(),
                        child: child_key.as_str(),
                    })?;

                if let Some(existing) = defs[child_idx].parent {
                    return MultipleParentsSnafu {
                        child: child_key.as_str(),
                        first_parent: defs[existing].element_key.as_str(),
                        second_parent: spec.element_key.as_str(),
                    }
                    .fail();
                }

                let expected = format!("{}_{}", spec.element_key, defs[child_idx].element_name);
                ensure!(
                    *child_key == expected,
                    NamingConventionSnafu {
                        parent: spec.element_key.as_str(),
                        child: child_key.as_str(),
                        expected,
                    }
                );

                defs[child_idx].parent = Some(parent_idx);
                defs[parent_idx].children.push(child_idx);
            }
        }

        for def in &defs {
            if def.data_type() == ElementDataType::Array {
                ensure!(
                    def.children.len() == 1,
                    ArrayAritySnafu {
                        element_key: def.element_key.as_str(),
                        children: def.children.len(),
                    }
                );
            }
        }

        mark_units_of_retention(&mut defs);

        log::debug!(
            "compiled {} columns ({} retained)",
            defs.len(),
            defs.iter().filter(|d| d.unit_of_retention).count()
        );
        let mut declared = vec![0; order.len()];
        for (arena_idx, &declared_idx) in order.iter().enumerate() {
            declared[declared_idx] = arena_idx;
        }
        Ok(Self { defs, declared })
    }

    /// All definitions, sorted by elementKey.
    pub fn definitions(&self) -> &[ColumnDefinition] {
        &self.defs
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// True for a forest without columns.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Arena index of `element_key`, by binary search.
    pub fn position(&self, element_key: &str) -> Option<usize> {
        self.defs
            .binary_search_by(|d| d.element_key.as_str().cmp(element_key))
            .ok()
    }

    /// Binary search for `element_key`.
    pub fn find(&self, element_key: &str) -> Result<&ColumnDefinition, SchemaError> {
        self.position(element_key)
            .map(|idx| &self.defs[idx])
            .context(ColumnNotFoundSnafu { element_key })
    }

    /// Definition at an arena index.
    pub fn get(&self, index: usize) -> Option<&ColumnDefinition> {
        self.defs.get(index)
    }

    /// Parent of `def`, if it is not a root.
    pub fn parent(&self, def: &ColumnDefinition) -> Option<&ColumnDefinition> {
        def.parent.and_then(|idx| self.defs.get(idx))
    }

    /// Children of `def`, in declared order.
    pub fn children<'a>(
        &'a self,
        def: &'a ColumnDefinition,
    ) -> impl Iterator<Item = &'a ColumnDefinition> + 'a {
        def.children.iter().filter_map(|&idx| self.defs.get(idx))
    }

    /// Root columns, sorted by elementKey.
    pub fn roots(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.defs.iter().filter(|d| d.parent.is_none())
    }

    /// Columns stored as their own physical field, sorted by elementKey.
    pub fn retention_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.defs.iter().filter(|d| d.unit_of_retention)
    }

    /// Keys of the retained columns, sorted.
    pub fn retention_column_names(&self) -> Vec<&str> {
        self.retention_columns().map(|d| d.element_key()).collect()
    }

    /// True when `element_key` names a retained column.
    pub fn is_retained(&self, element_key: &str) -> bool {
        self.find(element_key)
            .is_ok_and(ColumnDefinition::is_unit_of_retention)
    }

    /// Definitions in the order the columns were declared.
    pub fn declared(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.declared.iter().filter_map(|&idx| self.defs.get(idx))
    }

    /// Retained `rowpath` columns, whose values reference row attachments,
    /// in declared order.
    pub fn file_attachment_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.declared()
            .filter(|d| d.unit_of_retention && d.data_type() == ElementDataType::Rowpath)
    }

    /// True when both forests define the same columns, whatever their
    /// declared order.
    pub fn same_columns(&self, other: &ColumnForest) -> bool {
        self.defs == other.defs
    }

    /// The flat column list this forest was compiled from, in declared order.
    pub fn to_specs(&self) -> Vec<ColumnSpec> {
        self.declared()
            .map(|d| ColumnSpec {
                element_key: d.element_key.clone(),
                element_name: d.element_name.clone(),
                element_type: d.element_type.as_str().to_string(),
                list_child_element_keys: d
                    .children
                    .iter()
                    .map(|&idx| self.defs[idx].element_key.clone())
                    .collect(),
            })
            .collect()
    }
}

/// Sweep 1 folds every descendant of an array into the array's value.
/// Sweep 2 folds any remaining non-array column with children into its
/// children.
fn mark_units_of_retention(defs: &mut [ColumnDefinition]) {
    let mut queue = std::collections::VecDeque::new();
    for idx in 0..defs.len() {
        if defs[idx].data_type() != ElementDataType::Array || !defs[idx].unit_of_retention {
            continue;
        }
        queue.extend(defs[idx].children.iter().copied());
        while let Some(child) = queue.pop_front() {
            if !defs[child].unit_of_retention {
                continue;
            }
            defs[child].unit_of_retention = false;
            queue.extend(defs[child].children.iter().copied());
        }
    }

    for def in defs.iter_mut() {
        if def.data_type() != ElementDataType::Array && !def.children.is_empty() {
            def.unit_of_retention = false;
        }
    }
}
