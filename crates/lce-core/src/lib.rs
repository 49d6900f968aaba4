//! Core catalog model, column values and per-entity schema descriptors for LCE.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "lce-core";

/// Column carrying the ingestion batch identifier on every loaded row.
pub const PROVENANCE_COLUMN: &str = "source_file";

pub const ARTIFACT_PREFIX: &str = "microsoft_learn_catalog_";
pub const ARTIFACT_EXTENSION: &str = "json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid catalog document: {0}")]
    InvalidDocument(String),
    #[error("invalid source name {name:?}: {reason}")]
    InvalidSourceName { name: String, reason: &'static str },
}

/// Scalar, JSON-collection or null value held by one table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Json(String),
}

impl ColumnValue {
    /// Empty strings and empty collections collapse to `Null`; non-empty
    /// collections become compact JSON text with sorted object keys.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            JsonValue::String(s) if s.is_empty() => Self::Null,
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) if items.is_empty() => Self::Null,
            JsonValue::Object(map) if map.is_empty() => Self::Null,
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json(value.to_string()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Json(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Flat relational projection of one entity collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<ColumnValue>>,
}

impl EntityTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<ColumnValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn push_row(&mut self, row: Vec<ColumnValue>) -> Result<(), CatalogError> {
        if row.len() != self.columns.len() {
            return Err(CatalogError::InvalidArgument(format!(
                "row for table {} has {} values, expected {}",
                self.name,
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&ColumnValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Row `row` as (column, value) pairs in column order.
    pub fn row(&self, row: usize) -> Option<impl Iterator<Item = (&str, &ColumnValue)> + '_> {
        self.rows
            .get(row)
            .map(|values| self.columns.iter().map(String::as_str).zip(values.iter()))
    }
}

/// Declarative mapping from a catalog collection to its destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    pub collection: &'static str,
    pub table: &'static str,
    pub fields: &'static [&'static str],
}

impl EntitySchema {
    pub fn field_values(&self) -> Vec<JsonValue> {
        self.fields
            .iter()
            .map(|f| JsonValue::String((*f).to_string()))
            .collect()
    }
}

pub const CATALOG_SCHEMA: &[EntitySchema] = &[
    EntitySchema {
        collection: "modules",
        table: "modules",
        fields: &[
            "title", "summary", "locale", "levels", "roles", "products", "subjects", "url",
            "last_modified", "source_file",
        ],
    },
    EntitySchema {
        collection: "units",
        table: "units",
        fields: &["title", "locale", "duration_in_minutes", "last_modified", "source_file"],
    },
    EntitySchema {
        collection: "learningPaths",
        table: "learning_paths",
        fields: &[
            "title", "summary", "locale", "levels", "products", "subjects", "source_file",
        ],
    },
    EntitySchema {
        collection: "appliedSkills",
        table: "applied_skills",
        fields: &[
            "title", "summary", "locale", "levels", "roles", "products", "subjects", "url",
            "last_modified", "source_file",
        ],
    },
    EntitySchema {
        collection: "certifications",
        table: "certifications",
        fields: &[
            "title", "subtitle", "url", "last_modified", "certification_type", "exams", "levels",
            "roles", "source_file",
        ],
    },
    EntitySchema {
        collection: "mergedCertifications",
        table: "merged_certifications",
        fields: &[
            "title", "summary", "url", "last_modified", "certification_type", "products",
            "levels", "roles", "subjects", "prerequisites", "skills", "providers", "career_paths",
            "source_file",
        ],
    },
    EntitySchema {
        collection: "exams",
        table: "exams",
        fields: &[
            "title", "subtitle", "url", "last_modified", "levels", "roles", "products",
            "providers", "source_file",
        ],
    },
    EntitySchema {
        collection: "courses",
        table: "courses",
        fields: &[
            "title", "summary", "duration_in_hours", "url", "last_modified", "levels", "roles",
            "products", "source_file",
        ],
    },
    EntitySchema {
        collection: "levels",
        table: "levels",
        fields: &["name", "source_file"],
    },
    EntitySchema {
        collection: "products",
        table: "products",
        fields: &["name", "children", "source_file"],
    },
    EntitySchema {
        collection: "roles",
        table: "roles",
        fields: &["name", "source_file"],
    },
    EntitySchema {
        collection: "subjects",
        table: "subjects",
        fields: &["name", "children", "source_file"],
    },
];

pub fn schema_for_table(table: &str) -> Option<&'static EntitySchema> {
    CATALOG_SCHEMA.iter().find(|s| s.table == table)
}

/// Validated batch identifier recorded in the provenance column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceName(String);

impl SourceName {
    pub fn parse(name: impl Into<String>) -> Result<Self, CatalogError> {
        let name = name.into();
        let reason = if name.trim().is_empty() {
            Some("must not be empty")
        } else if name == "." || name == ".." {
            Some("must name a file")
        } else if name.contains('/') || name.contains('\\') {
            Some("must be a bare file name without path separators")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(CatalogError::InvalidSourceName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceName {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SourceName> for String {
    fn from(value: SourceName) -> Self {
        value.0
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn artifact_name(fetched_on: NaiveDate) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}.{ARTIFACT_EXTENSION}",
        fetched_on.format("%Y%m%d")
    )
}

/// Fetch date encoded in an artifact name, if it follows the dated naming scheme.
pub fn artifact_date(name: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_EXTENSION)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
}

/// Raw catalog payload: collection name -> ordered entity records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogDocument {
    collections: Map<String, JsonValue>,
}

impl CatalogDocument {
    pub fn from_value(value: JsonValue) -> Result<Self, CatalogError> {
        match value {
            JsonValue::Object(collections) => Ok(Self { collections }),
            other => Err(CatalogError::InvalidDocument(format!(
                "top-level value must be an object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CatalogError> {
        let value: JsonValue = serde_json::from_slice(bytes)
            .map_err(|err| CatalogError::InvalidDocument(err.to_string()))?;
        Self::from_value(value)
    }

    /// Records of `key`; an absent collection yields no records.
    pub fn collection(&self, key: &str) -> Result<&[JsonValue], CatalogError> {
        match self.collections.get(key) {
            None | Some(JsonValue::Null) => Ok(&[]),
            Some(JsonValue::Array(items)) => Ok(items.as_slice()),
            Some(other) => Err(CatalogError::InvalidDocument(format!(
                "collection {key} must be an array, found {}",
                json_kind(other)
            ))),
        }
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }
}

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_collections_and_strings_become_null() {
        assert_eq!(ColumnValue::from_json(&json!([])), ColumnValue::Null);
        assert_eq!(ColumnValue::from_json(&json!({})), ColumnValue::Null);
        assert_eq!(ColumnValue::from_json(&json!("")), ColumnValue::Null);
        assert_eq!(ColumnValue::from_json(&json!(null)), ColumnValue::Null);
    }

    #[test]
    fn nested_values_decode_back_to_same_structure() {
        let nested = json!({"b": [1, 2, {"c": null}], "a": "x"});
        let ColumnValue::Json(text) = ColumnValue::from_json(&nested) else {
            panic!("expected json column value");
        };
        assert_eq!(text, r#"{"a":"x","b":[1,2,{"c":null}]}"#);
        let decoded: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, nested);
    }

    #[test]
    fn scalars_keep_their_type() {
        assert_eq!(ColumnValue::from_json(&json!(42)), ColumnValue::Integer(42));
        assert_eq!(ColumnValue::from_json(&json!(1.5)), ColumnValue::Float(1.5));
        assert_eq!(ColumnValue::from_json(&json!(true)), ColumnValue::Bool(true));
        assert_eq!(
            ColumnValue::from_json(&json!("en-us")),
            ColumnValue::Text("en-us".into())
        );
    }

    #[test]
    fn every_schema_entry_ends_with_provenance_column() {
        assert_eq!(CATALOG_SCHEMA.len(), 12);
        for schema in CATALOG_SCHEMA {
            assert_eq!(schema.fields.last(), Some(&PROVENANCE_COLUMN), "{}", schema.table);
        }
        assert_eq!(
            schema_for_table("learning_paths").map(|s| s.collection),
            Some("learningPaths")
        );
    }

    #[test]
    fn source_names_must_be_bare_file_names() {
        assert!(SourceName::parse("microsoft_learn_catalog_20240101.json").is_ok());
        assert!(SourceName::parse("").is_err());
        assert!(SourceName::parse("..").is_err());
        assert!(SourceName::parse("../etc/passwd").is_err());
        assert!(SourceName::parse("files\\x.json").is_err());
    }

    #[test]
    fn artifact_names_encode_fetch_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let name = artifact_name(date);
        assert_eq!(name, "microsoft_learn_catalog_20240307.json");
        assert_eq!(artifact_date(&name), Some(date));
        assert_eq!(artifact_date("batch1"), None);
    }

    #[test]
    fn document_collections_are_arrays_or_absent() {
        let doc = CatalogDocument::from_value(json!({"modules": [{"title": "A"}], "units": 3}))
            .unwrap();
        assert_eq!(doc.collection("modules").unwrap().len(), 1);
        assert!(doc.collection("roles").unwrap().is_empty());
        assert!(matches!(
            doc.collection("units"),
            Err(CatalogError::InvalidDocument(_))
        ));
        assert!(CatalogDocument::from_slice(b"[1,2]").is_err());
    }

    #[test]
    fn table_rows_must_match_column_count() {
        let mut table = EntityTable::new("roles", vec!["name".into(), "source_file".into()]);
        table
            .push_row(vec![ColumnValue::Text("admin".into()), ColumnValue::Text("b".into())])
            .unwrap();
        assert!(table.push_row(vec![ColumnValue::Null]).is_err());
        assert_eq!(table.value(0, "name"), Some(&ColumnValue::Text("admin".into())));
        let pairs: Vec<_> = table.row(0).unwrap().collect();
        assert_eq!(pairs[1].0, "source_file");
    }
}
