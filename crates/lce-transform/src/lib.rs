//! Flattens catalog collections into provenance-stamped entity tables.

use lce_core::{
    json_kind, CatalogDocument, CatalogError, ColumnValue, EntitySchema, EntityTable, SourceName,
    PROVENANCE_COLUMN,
};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "lce-transform";

fn validate_fields(table_name: &str, fields: &[JsonValue]) -> Result<Vec<String>, CatalogError> {
    let mut columns = Vec::with_capacity(fields.len() + 1);
    for (idx, field) in fields.iter().enumerate() {
        let name = match field {
            JsonValue::String(name) if !name.trim().is_empty() => name,
            JsonValue::String(_) => {
                return Err(CatalogError::InvalidArgument(format!(
                    "field #{idx} for table {table_name} is an empty name"
                )))
            }
            other => {
                return Err(CatalogError::InvalidArgument(format!(
                    "field #{idx} for table {table_name} must be a text value, found {}",
                    json_kind(other)
                )))
            }
        };
        if columns.contains(name) {
            return Err(CatalogError::InvalidArgument(format!(
                "field {name} is requested twice for table {table_name}"
            )));
        }
        columns.push(name.clone());
    }
    if !columns.iter().any(|c| c == PROVENANCE_COLUMN) {
        columns.push(PROVENANCE_COLUMN.to_string());
    }
    Ok(columns)
}

/// Project `rows` onto `fields`, stamping every row with `source_name`.
///
/// Returns `Ok(None)` when no fields are requested. The provenance column is
/// always present, appended last when the caller did not ask for it.
pub fn transform(
    table_name: &str,
    rows: &[JsonValue],
    source_name: &SourceName,
    fields: &[JsonValue],
) -> Result<Option<EntityTable>, CatalogError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let columns = validate_fields(table_name, fields)?;
    let mut table = EntityTable::new(table_name, columns);

    for (idx, record) in rows.iter().enumerate() {
        let JsonValue::Object(record) = record else {
            return Err(CatalogError::InvalidArgument(format!(
                "record #{idx} for table {table_name} must be an object, found {}",
                json_kind(record)
            )));
        };
        let row = table
            .columns()
            .iter()
            .map(|column| {
                if column == PROVENANCE_COLUMN {
                    ColumnValue::Text(source_name.to_string())
                } else {
                    record
                        .get(column)
                        .map_or(ColumnValue::Null, ColumnValue::from_json)
                }
            })
            .collect();
        table.push_row(row)?;
    }

    debug!(table = table_name, rows = table.row_count(), "transformed");
    Ok(Some(table))
}

pub fn transform_entity(
    schema: &EntitySchema,
    document: &CatalogDocument,
    source_name: &SourceName,
) -> Result<Option<EntityTable>, CatalogError> {
    let rows = document.collection(schema.collection)?;
    transform(schema.table, rows, source_name, &schema.field_values())
}

/// Transform every described entity, in descriptor order.
pub fn transform_catalog(
    schemas: &[EntitySchema],
    document: &CatalogDocument,
    source_name: &SourceName,
) -> Result<Vec<EntityTable>, CatalogError> {
    for name in document.collection_names() {
        if !schemas.iter().any(|s| s.collection == name) {
            debug!(collection = name, "collection has no table mapping, ignored");
        }
    }

    let mut tables = Vec::with_capacity(schemas.len());
    for schema in schemas {
        match transform_entity(schema, document, source_name)? {
            Some(table) => tables.push(table),
            None => warn!(table = schema.table, "no fields requested, table skipped"),
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lce_core::CATALOG_SCHEMA;
    use serde_json::json;

    fn batch() -> SourceName {
        SourceName::parse("batch1").unwrap()
    }

    fn fields(names: &[&str]) -> Vec<JsonValue> {
        names.iter().map(|n| json!(n)).collect()
    }

    #[test]
    fn empty_nested_values_become_null() {
        let rows = vec![json!({"levels": [], "children": {}, "roles": ["admin"]})];
        let table = transform("t", &rows, &batch(), &fields(&["levels", "children", "roles"]))
            .unwrap()
            .unwrap();
        assert_eq!(table.value(0, "levels"), Some(&ColumnValue::Null));
        assert_eq!(table.value(0, "children"), Some(&ColumnValue::Null));
        assert_eq!(
            table.value(0, "roles"),
            Some(&ColumnValue::Json(r#"["admin"]"#.into()))
        );
    }

    #[test]
    fn nested_values_round_trip_through_json_text() {
        let children = json!([{"name": "Azure", "children": [{"name": "Functions"}]}]);
        let rows = vec![json!({"name": "cloud", "children": children.clone()})];
        let table = transform("products", &rows, &batch(), &fields(&["name", "children"]))
            .unwrap()
            .unwrap();
        let text = table.value(0, "children").and_then(ColumnValue::as_text).unwrap();
        let decoded: JsonValue = serde_json::from_str(text).unwrap();
        assert_eq!(decoded, children);
    }

    #[test]
    fn provenance_is_appended_when_not_requested() {
        let rows = vec![json!({"name": "a"}), json!({"name": "b", "source_file": "other"})];
        let table = transform("roles", &rows, &batch(), &fields(&["name"]))
            .unwrap()
            .unwrap();
        assert_eq!(table.columns(), &["name".to_string(), "source_file".to_string()]);
        for row in 0..table.row_count() {
            assert_eq!(
                table.value(row, "source_file"),
                Some(&ColumnValue::Text("batch1".into()))
            );
        }
    }

    #[test]
    fn zero_fields_yield_no_table() {
        let rows = vec![json!({"name": "a"})];
        assert_eq!(transform("roles", &rows, &batch(), &[]).unwrap(), None);
    }

    #[test]
    fn non_text_field_name_is_invalid_argument() {
        let rows = vec![json!({"name": "a"})];
        let err = transform("roles", &rows, &batch(), &[json!("name"), json!(7)]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));

        let err = transform("roles", &rows, &batch(), &[json!("")]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let err = transform("roles", &[], &batch(), &fields(&["name", "name"])).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));
    }

    #[test]
    fn non_object_records_are_rejected() {
        let rows = vec![json!({"name": "a"}), json!("loose")];
        let err = transform("roles", &rows, &batch(), &fields(&["name"])).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));
    }

    #[test]
    fn missing_keys_are_null_and_output_is_limited_to_requested_fields() {
        let rows = vec![json!({"title": "A", "uid": "x", "extra": [1]})];
        let table = transform("units", &rows, &batch(), &fields(&["title", "locale", "source_file"]))
            .unwrap()
            .unwrap();
        assert_eq!(table.columns().len(), 3);
        assert_eq!(table.value(0, "locale"), Some(&ColumnValue::Null));
        assert_eq!(table.value(0, "uid"), None);
    }

    #[test]
    fn catalog_transform_covers_every_entity() {
        let document = CatalogDocument::from_value(json!({
            "modules": [{"title": "A"}, {"title": "B"}],
            "roles": [{"name": "admin"}],
        }))
        .unwrap();
        let tables = transform_catalog(CATALOG_SCHEMA, &document, &batch()).unwrap();
        assert_eq!(tables.len(), CATALOG_SCHEMA.len());
        assert_eq!(tables[0].name(), "modules");
        assert_eq!(tables[0].row_count(), 2);
        let roles = tables.iter().find(|t| t.name() == "roles").unwrap();
        assert_eq!(roles.row_count(), 1);
        let units = tables.iter().find(|t| t.name() == "units").unwrap();
        assert!(units.is_empty());
    }
}
