//! Foreign sources and their unification into the intermediate store
//!
//! A [`ForeignSource`] knows how to enumerate its tables and hand out pages of
//! rows. The [`SourceUnifier`] turns any of them into shadow tables keyed by
//! `__source_unique_id`, tracking provenance in the [`OriginRegistry`].

pub mod csv;
pub mod origin;
pub mod sql;
pub mod sqlite;
pub mod unifier;

pub use self::csv::CsvSource;
pub use origin::{resolve_placeholders, OriginRegistry};
pub use sql::{SqlDialect, SqlSource};
pub use sqlite::SqliteSource;
pub use unifier::{ImportReport, SourceUnifier};

use crate::error::Result;
use crate::value::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder in `onCreate` statements replaced by the quoted shadow table name
pub const TABLE_NAME_PLACEHOLDER: &str = "%TABLE_NAME_IN_SOURCE%";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignColumn {
    pub name: String,
    /// Declared type in the foreign store
    pub sql_type: String,
}

impl ForeignColumn {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignTable {
    pub name: String,
    pub columns: Vec<ForeignColumn>,
    pub primary_key: Vec<String>,
}

impl ForeignTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One page of a foreign table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    /// Extra filter, passed through verbatim from the import options
    pub filter: Option<String>,
    /// Paging order; an override string or the key columns
    pub order_by: Option<String>,
    /// Key columns to order by when no override is given
    pub key: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Read access to a foreign store
#[async_trait]
pub trait ForeignSource: Send + Sync {
    /// Kind of store, recorded as `origin_type` (`postgres`, `mysql`, `sqlite`, `csv`)
    fn origin_type(&self) -> &str;

    /// Database (or file) name, recorded as `origin_database_name`
    fn database_name(&self) -> &str;

    /// Tables with columns and declared primary keys, sorted by name
    async fn tables(&self) -> Result<Vec<ForeignTable>>;

    /// Rows of `table` in column order of [`ForeignTable::columns`]
    async fn fetch_page(&self, table: &ForeignTable, page: &PageRequest) -> Result<Vec<Row>>;
}

/// Per-table import settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOverride {
    #[serde(rename = "where")]
    pub filter: Option<String>,
    pub limit: Option<usize>,
    pub orderby: Option<String>,
    /// Run after the shadow table is created
    #[serde(rename = "onCreate", alias = "on_create")]
    pub on_create: Option<String>,
    /// Key columns replacing the declared primary key
    pub key: Option<Vec<String>>,
}

/// Table selection and paging for one import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub include_tables: BTreeMap<String, TableOverride>,
    /// Import only the included tables instead of all tables
    pub include_exclusive: bool,
    pub exclude_tables: Vec<String>,
    pub page_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            include_tables: BTreeMap::new(),
            include_exclusive: false,
            exclude_tables: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ImportOptions {
    /// Import exactly the given tables
    pub fn only<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include_tables: tables
                .into_iter()
                .map(|t| (t.into(), TableOverride::default()))
                .collect(),
            include_exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, table: impl Into<String>, table_override: TableOverride) -> Self {
        self.include_tables.insert(table.into(), table_override);
        self
    }

    pub fn exclude(mut self, table: impl Into<String>) -> Self {
        self.exclude_tables.push(table.into());
        self
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| crate::error::EtlError::config(e.to_string()))
    }

    /// Names mentioned in the include or exclude lists
    pub fn named_tables(&self) -> impl Iterator<Item = &str> {
        self.include_tables
            .keys()
            .map(String::as_str)
            .chain(self.exclude_tables.iter().map(String::as_str))
    }

    pub fn is_selected(&self, table: &str) -> bool {
        if self.exclude_tables.iter().any(|t| t == table) {
            return false;
        }
        !self.include_exclusive || self.include_tables.contains_key(table)
    }

    pub fn override_for(&self, table: &str) -> TableOverride {
        self.include_tables.get(table).cloned().unwrap_or_default()
    }
}

/// Join key values with `-`; `None` when there is no key or a key value is missing
pub fn unique_id_from_key(row: &Row, key: &[String]) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(key.len());
    for column in key {
        match row.get(column) {
            Some(value) if !value.is_null() => parts.push(value.as_text()?),
            _ => return None,
        }
    }
    Some(parts.join("-"))
}
