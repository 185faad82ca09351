//! Table and constraint definitions
//!
//! The same definitions describe tables we create (shadow tables, destination
//! tables) and tables we find by introspection. Every identifier that ends up
//! inside generated SQL is looked up here first, see
//! [`SchemaDefinition::require_table`] and [`TableDefinition::require_column`].

use crate::error::{EtlError, Result};

/// Quote an identifier for SQLite / PostgreSQL (`"name"`, inner quotes doubled)
pub fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Normalized storage type of a column
///
/// Everything that is not clearly an integer or binary is stored as text so no
/// precision is lost on decimals and dates.
pub fn translate_type(declared: &str) -> &'static str {
    let t = declared.trim().to_lowercase();
    let base = t.split(['(', ' ']).next().unwrap_or_default();
    match base {
        "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "smallint" | "tinyint"
        | "mediumint" | "serial" | "bigserial" | "smallserial" | "integer.2" => "integer",
        "blob" | "bytea" | "binary" | "varbinary" | "longblob" | "mediumblob" => "blob",
        _ => "text",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
    pub not_null: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            primary_key: false,
            not_null: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDefinition {
    pub own_columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    /// Checked at commit instead of per statement
    pub deferrable: bool,
    pub on_delete: Option<String>,
    /// Remote object type behind `ref_table`, when the table is an object table
    pub ref_objecttype: Option<String>,
}

impl ForeignKeyDefinition {
    pub fn new(
        own_columns: Vec<String>,
        ref_table: impl Into<String>,
        ref_columns: Vec<String>,
    ) -> Self {
        Self {
            own_columns,
            ref_table: ref_table.into(),
            ref_columns,
            deferrable: false,
            on_delete: None,
            ref_objecttype: None,
        }
    }

    pub fn single(own: &str, ref_table: impl Into<String>, ref_column: &str) -> Self {
        Self::new(vec![own.to_string()], ref_table, vec![ref_column.to_string()])
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub fn on_delete(mut self, action: impl Into<String>) -> Self {
        self.on_delete = Some(action.into());
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            join_quoted(&self.own_columns),
            quote_name(&self.ref_table),
            join_quoted(&self.ref_columns)
        );
        if let Some(action) = &self.on_delete {
            sql.push_str(" ON DELETE ");
            sql.push_str(action);
        }
        if self.deferrable {
            sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueDefinition {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub uniques: Vec<UniqueDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            uniques: Vec::new(),
        }
    }

    pub fn add_column(&mut self, column: ColumnDefinition) {
        if self.column(&column.name).is_none() {
            self.columns.push(column);
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.add_column(column);
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKeyDefinition) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn require_column(&self, name: &str) -> Result<&ColumnDefinition> {
        self.column(name)
            .ok_or_else(|| EtlError::column_not_found(&self.name, name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Single-column foreign key whose own column is `column`
    pub fn foreign_key_for(&self, column: &str) -> Option<&ForeignKeyDefinition> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.own_columns.len() == 1 && fk.own_columns[0] == column)
    }

    pub fn create_sql(&self) -> String {
        let pk = self.primary_key();
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_name(&c.name), c.sql_type);
                if c.primary_key && pk.len() == 1 {
                    def.push_str(" PRIMARY KEY");
                }
                if c.not_null {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        if pk.len() > 1 {
            let cols: Vec<String> = pk.iter().map(|c| c.to_string()).collect();
            parts.push(format!("PRIMARY KEY ({})", join_quoted(&cols)));
        }
        for unique in &self.uniques {
            parts.push(format!("UNIQUE ({})", join_quoted(&unique.columns)));
        }
        for fk in &self.foreign_keys {
            parts.push(fk.to_sql());
        }

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_name(&self.name),
            parts.join(",\n    ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDefinition {
    pub name: String,
    pub tables: Vec<TableDefinition>,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn require_table(&self, name: &str) -> Result<&TableDefinition> {
        self.table(name)
            .ok_or_else(|| EtlError::TableNotFound(name.to_string()))
    }

    /// Fail with every missing name at once, listing what does exist
    pub fn require_tables<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let missing: Vec<String> = names
            .into_iter()
            .filter(|n| self.table(n).is_none())
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EtlError::schema_mismatch(
                format!("tables in schema '{}'", self.name),
                missing,
                self.table_names(),
            ))
        }
    }
}

fn join_quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_name(n))
        .collect::<Vec<_>>()
        .join(", ")
}
