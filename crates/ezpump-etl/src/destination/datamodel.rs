//! Remote data model
//!
//! Parsed from the JSON returned by `GET schema/user/CURRENT?format=json`.
//! Only what the destination tables and the loader need is kept: object
//! types with their columns, foreign keys, unique keys and the hierarchy,
//! pool, tag and owner flags.

use crate::error::{EtlError, Result};
use crate::repository::{ForeignKeyDefinition, UniqueDefinition};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

/// Scalar type of a `column`-kind column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Reference to another object type through a foreign key
    Link,
    /// Asset column, stored in a satellite `asset.<type>.<column>` table
    Eas,
    /// Localized text, one destination column per language
    L10n(String),
    Date,
    Datetime,
    /// `"from|to"` in the store
    Daterange,
    /// `decimal.2`
    Decimal,
    /// `integer.2`
    Integer,
    Boolean,
    /// Any other type, passed through as text
    Text(String),
}

impl ColumnType {
    pub fn parse(type_name: &str) -> Self {
        match type_name {
            "link" => ColumnType::Link,
            "eas" => ColumnType::Eas,
            "date" => ColumnType::Date,
            "datetime" => ColumnType::Datetime,
            "daterange" => ColumnType::Daterange,
            "decimal.2" => ColumnType::Decimal,
            "integer.2" | "integer" => ColumnType::Integer,
            "boolean" => ColumnType::Boolean,
            t if t.contains("l10n") => ColumnType::L10n(t.to_string()),
            t => ColumnType::Text(t.to_string()),
        }
    }

    /// Storage type of the destination column
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "integer",
            _ => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// A field of the object itself
    Column(ColumnType),
    /// Owned objects of another type, nested as `_nested:<other>`
    Link { other_table: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EasydbColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl EasydbColumn {
    pub fn column_type(&self) -> Option<&ColumnType> {
        match &self.kind {
            ColumnKind::Column(t) => Some(t),
            ColumnKind::Link { .. } => None,
        }
    }

    pub fn is_eas(&self) -> bool {
        matches!(self.column_type(), Some(ColumnType::Eas))
    }

    pub fn is_link_column(&self) -> bool {
        matches!(self.column_type(), Some(ColumnType::Link))
    }

    pub fn is_l10n(&self) -> bool {
        matches!(self.column_type(), Some(ColumnType::L10n(_)))
    }

    pub fn nested_type(&self) -> Option<&str> {
        match &self.kind {
            ColumnKind::Link { other_table } => Some(other_table),
            ColumnKind::Column(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectType {
    pub name: String,
    pub columns: Vec<EasydbColumn>,
    /// Foreign keys; `ref_table` is the bare object type name here
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub uniques: Vec<UniqueDefinition>,
    pub pool_link: bool,
    pub is_hierarchical: bool,
    pub has_tags: bool,
    /// Owning object type for nested objects
    pub owned_by: Option<String>,
}

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            uniques: Vec::new(),
            pool_link: false,
            is_hierarchical: false,
            has_tags: false,
            owned_by: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&EasydbColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Object type referenced by the foreign key on `column`
    pub fn link_target(&self, column: &str) -> Option<&str> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.own_columns.iter().any(|c| c == column))
            .map(|fk| fk.ref_objecttype.as_deref().unwrap_or(fk.ref_table.as_str()))
    }

    pub fn has_links(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.is_link_column() || c.nested_type().is_some())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EasydbSchema {
    pub schema_type: String,
    pub version: String,
    /// In schema order
    pub objecttypes: Vec<ObjectType>,
}

impl EasydbSchema {
    pub fn parse(js: &JsonValue) -> Result<Self> {
        let raw: RawSchema = serde_json::from_value(js.clone())?;
        let version = match &raw.version {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        info!(schema_type = %raw.schema_type, version = %version, tables = raw.tables.len(), "load schema");

        let objecttypes = raw
            .tables
            .into_iter()
            .map(RawTable::into_objecttype)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_type: raw.schema_type,
            version,
            objecttypes,
        })
    }

    pub fn objecttype(&self, name: &str) -> Option<&ObjectType> {
        self.objecttypes.iter().find(|ot| ot.name == name)
    }

    pub fn require_objecttype(&self, name: &str) -> Result<&ObjectType> {
        self.objecttype(name).ok_or_else(|| {
            EtlError::schema_mismatch(
                "object types",
                vec![name.to_string()],
                self.objecttypes.iter().map(|ot| ot.name.clone()).collect(),
            )
        })
    }
}

/// Database languages from the `config/list` response
pub fn parse_languages(config: &JsonValue) -> Result<Vec<String>> {
    let system = config
        .get("system")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| EtlError::protocol("config has no \"system\" key"))?;
    let languages = system
        .iter()
        .find(|var| var.get("name").and_then(JsonValue::as_str) == Some("languages"))
        .ok_or_else(|| EtlError::protocol("config[\"system\"] has no \"languages\" variable"))?;
    let choices = languages
        .pointer("/parameters/database/choices")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| EtlError::protocol("languages variable has no parameters.database.choices"))?;
    Ok(choices
        .iter()
        .filter_map(JsonValue::as_str)
        .map(str::to_string)
        .collect())
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Deserialize)]
struct RawSchema {
    #[serde(rename = "type")]
    schema_type: String,
    #[serde(default)]
    version: JsonValue,
    tables: Vec<RawTable>,
}

#[derive(Deserialize)]
struct RawTable {
    name: String,
    columns: Vec<RawColumn>,
    #[serde(default)]
    pool_link: bool,
    #[serde(default)]
    unique_keys: Vec<RawUniqueKey>,
    #[serde(default)]
    foreign_keys: Vec<RawForeignKey>,
    #[serde(default)]
    is_hierarchical: bool,
    #[serde(default)]
    has_tags: bool,
    #[serde(default)]
    owned_by: Option<RawOwner>,
}

#[derive(Deserialize)]
#[serde(tag = "kind")]
enum RawColumn {
    #[serde(rename = "column")]
    Column {
        name: String,
        #[serde(rename = "type")]
        column_type: String,
    },
    #[serde(rename = "link")]
    Link { other_table_name_hint: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize)]
struct RawKeyColumn {
    column_name_hint: Option<String>,
    auto_column_primary_key: Option<JsonValue>,
}

impl RawKeyColumn {
    fn name(&self) -> Option<String> {
        match (&self.column_name_hint, &self.auto_column_primary_key) {
            (Some(hint), _) => Some(hint.clone()),
            (None, Some(_)) => Some(SOURCE_UNIQUE_ID.to_string()),
            (None, None) => None,
        }
    }
}

#[derive(Deserialize)]
struct RawUniqueKey {
    columns: Vec<RawKeyColumn>,
}

#[derive(Deserialize)]
struct RawForeignKey {
    columns: Vec<RawKeyColumn>,
    referenced_table: RawReferencedTable,
}

#[derive(Deserialize)]
struct RawReferencedTable {
    name_hint: String,
    columns: Vec<RawKeyColumn>,
}

#[derive(Deserialize)]
struct RawOwner {
    other_table_name_hint: String,
}

fn key_columns(table: &str, columns: &[RawKeyColumn]) -> Result<Vec<String>> {
    columns
        .iter()
        .map(|c| {
            c.name().ok_or_else(|| {
                EtlError::protocol(format!(
                    "foreign key column of table '{}' has neither column_name_hint nor auto_column_primary_key",
                    table
                ))
            })
        })
        .collect()
}

impl RawTable {
    fn into_objecttype(self) -> Result<ObjectType> {
        debug!(table = %self.name, columns = self.columns.len(), "load table");
        let mut ot = ObjectType::new(self.name.as_str());
        for column in self.columns {
            match column {
                RawColumn::Column { name, column_type } => ot.columns.push(EasydbColumn {
                    name,
                    kind: ColumnKind::Column(ColumnType::parse(&column_type)),
                }),
                RawColumn::Link {
                    other_table_name_hint,
                } => ot.columns.push(EasydbColumn {
                    name: format!("_nested:{}", other_table_name_hint),
                    kind: ColumnKind::Link {
                        other_table: other_table_name_hint,
                    },
                }),
                RawColumn::Unsupported => {},
            }
        }
        // Unique keys over auto columns other than the primary key are skipped
        for unique in &self.unique_keys {
            if let Ok(columns) = key_columns(&self.name, &unique.columns) {
                ot.uniques.push(UniqueDefinition { columns });
            }
        }
        for fk in &self.foreign_keys {
            let own = key_columns(&self.name, &fk.columns)?;
            let referenced = key_columns(&self.name, &fk.referenced_table.columns)?;
            let mut definition =
                ForeignKeyDefinition::new(own, fk.referenced_table.name_hint.as_str(), referenced);
            definition.ref_objecttype = Some(fk.referenced_table.name_hint.clone());
            ot.foreign_keys.push(definition);
        }
        ot.pool_link = self.pool_link;
        ot.is_hierarchical = self.is_hierarchical;
        ot.has_tags = self.has_tags;
        ot.owned_by = self.owned_by.map(|o| o.other_table_name_hint);
        Ok(ot)
    }
}
