//! Attachment references carried by a row.
//!
//! File attachments are referenced from `rowpath` columns. The file-sync side
//! of a client only needs the non-null fragments, not the whole row, so the
//! list is derived once when a row is built, following the column
//! declaration.
use crate::{row::DataKeyValue, schema::ColumnForest};

/// Non-null values of the file-attachment columns of `forest`, in the order
/// those columns were declared.
///
/// `values` must be canonical (sorted by column key).
pub fn uri_fragments(forest: &ColumnForest, values: &[DataKeyValue]) -> Vec<String> {
    forest
        .file_attachment_columns()
        .filter_map(|column| {
            let idx = values
                .binary_search_by(|kv| kv.column.as_str().cmp(column.element_key()))
                .ok()?;
            values[idx].value.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::canonical_values;
    use crate::schema::ColumnSpec;
    use std::collections::BTreeMap;

    #[test]
    fn collects_non_null_fragments_in_column_order() {
        let forest = ColumnForest::build(&[
            ColumnSpec::new("audio", "rowpath"),
            ColumnSpec::new("name", "string"),
            ColumnSpec::new("photo", "mimeUri")
                .with_children(["photo_contentType", "photo_uriFragment"]),
            ColumnSpec::nested("photo", "contentType", "string"),
            ColumnSpec::nested("photo", "uriFragment", "rowpath"),
            ColumnSpec::new("video", "rowpath"),
        ])
        .unwrap();

        let values: BTreeMap<String, Option<String>> = [
            ("video", Some("v.mp4")),
            ("name", Some("not a file")),
            ("photo_uriFragment", Some("p.jpg")),
            ("photo_contentType", Some("image/jpeg")),
            ("audio", None),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect();

        let canonical = canonical_values(&forest, &values).unwrap();
        assert_eq!(uri_fragments(&forest, &canonical), vec!["p.jpg", "v.mp4"]);
    }

    #[test]
    fn fragments_follow_declaration_not_key_order() {
        let forest = ColumnForest::build(&[
            ColumnSpec::new("zz_scan", "rowpath"),
            ColumnSpec::new("aa_photo", "rowpath"),
        ])
        .unwrap();
        let values: BTreeMap<String, Option<String>> = [
            ("aa_photo".to_string(), Some("photo.jpg".to_string())),
            ("zz_scan".to_string(), Some("scan.pdf".to_string())),
        ]
        .into_iter()
        .collect();
        let canonical = canonical_values(&forest, &values).unwrap();
        assert_eq!(uri_fragments(&forest, &canonical), vec!["scan.pdf", "photo.jpg"]);
    }

    #[test]
    fn no_attachment_columns_means_no_fragments() {
        let forest = ColumnForest::build(&[ColumnSpec::new("name", "string")]).unwrap();
        let canonical = canonical_values(&forest, &BTreeMap::new()).unwrap();
        assert!(uri_fragments(&forest, &canonical).is_empty());
    }
}
