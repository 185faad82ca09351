//! `ezpump prepare` command implementation

use super::connect;
use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::destination::{CreatePolicy, Destination};
use ezpump_etl::repository::schema::{ColumnDefinition, TableDefinition};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Additional tables created as `user.<name>` next to the schema tables
///
/// ```toml
/// [[table]]
/// name = "mapping"
/// columns = [{ name = "old_id", type = "TEXT" }, { name = "new_id", type = "INTEGER" }]
/// ```
#[derive(Debug, Deserialize)]
struct UserTables {
    #[serde(default, rename = "table")]
    tables: Vec<UserTable>,
}

#[derive(Debug, Deserialize)]
struct UserTable {
    name: String,
    columns: Vec<UserColumn>,
}

#[derive(Debug, Deserialize)]
struct UserColumn {
    name: String,
    #[serde(rename = "type", default = "default_column_type")]
    sql_type: String,
}

fn default_column_type() -> String {
    "TEXT".to_string()
}

fn parse_user_tables(text: &str) -> anyhow::Result<Vec<TableDefinition>> {
    let parsed: UserTables = toml::from_str(text)?;
    parsed
        .tables
        .into_iter()
        .map(|table| {
            if table.columns.is_empty() {
                anyhow::bail!("user table '{}' has no columns", table.name);
            }
            Ok(table.columns.into_iter().fold(
                TableDefinition::new(table.name),
                |definition, column| {
                    definition.with_column(ColumnDefinition::new(column.name, column.sql_type))
                },
            ))
        })
        .collect()
}

fn read_user_tables(path: Option<&Path>) -> anyhow::Result<Vec<TableDefinition>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read user tables {}", path.display()))?;
    parse_user_tables(&text).with_context(|| format!("invalid user tables in {}", path.display()))
}

pub async fn run(config: &MigrationConfig, policy: &str, user_tables: Option<&Path>) -> anyhow::Result<()> {
    let policy: CreatePolicy = policy.parse()?;
    let user_tables = read_user_tables(user_tables)?;
    let api = connect(config).await?;

    let destination = Destination::prepare(&api, &config.destination_dir, policy, &user_tables)
        .await
        .context("cannot prepare destination")?;

    info!(
        dir = %config.destination_dir.display(),
        objecttypes = destination.schema().objecttypes.len(),
        "destination ready"
    );
    println!(
        "Destination ready: {} ({} object types, languages: {})",
        destination.db_path().display(),
        destination.schema().objecttypes.len(),
        destination.languages().join(", ")
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_tables() {
        let tables = parse_user_tables(
            r#"
            [[table]]
            name = "mapping"
            columns = [{ name = "old_id" }, { name = "new_id", type = "INTEGER" }]
            "#,
        )
        .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "mapping");
        assert_eq!(tables[0].columns[0].sql_type, "TEXT");
        assert_eq!(tables[0].columns[1].sql_type, "INTEGER");
    }

    #[test]
    fn test_user_table_without_columns_is_rejected() {
        assert!(parse_user_tables("[[table]]\nname = \"empty\"\ncolumns = []\n").is_err());
    }

    #[test]
    fn test_no_file_means_no_user_tables() {
        assert!(read_user_tables(None).unwrap().is_empty());
    }
}
