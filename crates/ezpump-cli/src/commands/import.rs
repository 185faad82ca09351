//! `ezpump import` command implementation
//!
//! Unifies a foreign source into shadow tables `<name>.<table>` of the
//! intermediate store.

use super::open_store;
use crate::config::MigrationConfig;
use crate::ImportCommand;
use anyhow::Context;
use ezpump_etl::source::{
    CsvSource, ForeignSource, ImportOptions, SourceUnifier, SqlSource, SqliteSource,
};
use std::path::Path;
use tracing::info;

/// Read include/exclude lists and table overrides from a TOML file
fn import_options(config: &MigrationConfig, path: Option<&Path>) -> anyhow::Result<ImportOptions> {
    let mut options = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read import options {}", path.display()))?;
            ImportOptions::from_toml(&text)
                .with_context(|| format!("invalid import options in {}", path.display()))?
        },
        None => ImportOptions::default(),
    };
    options.page_size = config.page_size;
    Ok(options)
}

fn delimiter_byte(delimiter: char) -> anyhow::Result<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        anyhow::bail!("CSV delimiter must be a single ASCII character, got '{}'", delimiter)
    }
}

impl ImportCommand {
    fn name(&self) -> &str {
        match self {
            ImportCommand::Sql { name, .. }
            | ImportCommand::Sqlite { name, .. }
            | ImportCommand::Csv { name, .. } => name,
        }
    }

    fn options_path(&self) -> Option<&Path> {
        match self {
            ImportCommand::Sql { options, .. }
            | ImportCommand::Sqlite { options, .. }
            | ImportCommand::Csv { options, .. } => options.as_deref(),
        }
    }

    async fn open_source(&self) -> anyhow::Result<Box<dyn ForeignSource>> {
        let source: Box<dyn ForeignSource> = match self {
            ImportCommand::Sql { url, schema, .. } => Box::new(
                SqlSource::connect(url, schema.as_deref())
                    .await
                    .context("cannot connect to source database")?,
            ),
            ImportCommand::Sqlite { path, .. } => Box::new(
                SqliteSource::open(path).with_context(|| format!("cannot open {}", path.display()))?,
            ),
            ImportCommand::Csv {
                path, delimiter, ..
            } => Box::new(
                CsvSource::open(path)
                    .with_context(|| format!("cannot open {}", path.display()))?
                    .with_delimiter(delimiter_byte(*delimiter)?),
            ),
        };
        Ok(source)
    }
}

pub async fn run(config: &MigrationConfig, command: &ImportCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let name = command.name();
    let source = command.open_source().await?;

    let options = import_options(config, command.options_path())?;
    let report = SourceUnifier::new(&store, name, options)
        .import(source.as_ref())
        .await
        .with_context(|| format!("import of source '{}' failed", name))?;
    store.close()?;

    for (table, rows) in &report.tables {
        println!("  {:<40} {:>10} rows", table, rows);
    }
    println!(
        "Imported source '{}': {} tables, {} rows, {} duplicate keys skipped",
        name,
        report.tables.len(),
        report.total_rows(),
        report.duplicates
    );
    info!(source = %name, rows = report.total_rows(), duplicates = report.duplicates, "import finished");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiter_byte() {
        assert_eq!(delimiter_byte(';').unwrap(), b';');
        assert_eq!(delimiter_byte('\t').unwrap(), b'\t');
        assert!(delimiter_byte('§').is_err());
    }

    #[test]
    fn test_import_options_take_page_size_from_config() {
        let config = MigrationConfig {
            page_size: 17,
            ..MigrationConfig::default()
        };
        assert_eq!(import_options(&config, None).unwrap().page_size, 17);
    }
}
