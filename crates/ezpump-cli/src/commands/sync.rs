//! `ezpump sync` command implementation
//!
//! Runs one query against the intermediate store and synchronizes its rows
//! into a destination table. Constant values are set first, then columns
//! are renamed, then rows with empty listed columns are dropped.

use super::{open_store, split_pair};
use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::destination::Destination;
use ezpump_etl::repository::Repository;
use ezpump_etl::sync::{
    AssetColumn, BatchSynchronizer, FilterByEmptyColumns, FixValues, QueryRows, Rename,
    RowTransformation,
};
use ezpump_etl::Row;
use tracing::info;

pub struct SyncArgs<'a> {
    pub table: &'a str,
    pub query: &'a str,
    pub assets: &'a [String],
    pub values: &'a [String],
    pub renames: &'a [String],
    pub skip_empty: &'a [String],
    pub defer_foreign_keys: bool,
}

/// `<source>.<table>.<column>=<destination column>` for objects of `objecttype`
fn parse_asset_column(arg: &str, objecttype: &str) -> anyhow::Result<AssetColumn> {
    let (source, destination_column) = split_pair(arg)?;
    let parts: Vec<&str> = source.splitn(3, '.').collect();
    let [source_name, table, column] = parts[..] else {
        anyhow::bail!("asset column must be '<source>.<table>.<column>=<column>', got '{}'", arg);
    };
    Ok(AssetColumn::new(source_name, table, column, objecttype, destination_column))
}

fn build_transformations(args: &SyncArgs<'_>) -> anyhow::Result<Vec<Box<dyn RowTransformation>>> {
    let mut transformations: Vec<Box<dyn RowTransformation>> = Vec::new();
    if !args.values.is_empty() {
        let mut values = Row::new();
        for pair in args.values {
            let (column, value) = split_pair(pair)?;
            values.set(column, value);
        }
        transformations.push(Box::new(FixValues::new(values)));
    }
    for pair in args.renames {
        let (from, to) = split_pair(pair)?;
        transformations.push(Box::new(Rename::new(from, to)));
    }
    if !args.skip_empty.is_empty() {
        transformations.push(Box::new(FilterByEmptyColumns::new(args.skip_empty.iter().cloned())));
    }
    Ok(transformations)
}

pub async fn run(config: &MigrationConfig, args: SyncArgs<'_>) -> anyhow::Result<()> {
    let objecttype = args.table.strip_prefix("easydb.").unwrap_or(args.table);
    let asset_columns = args
        .assets
        .iter()
        .map(|a| parse_asset_column(a, objecttype))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let transformations = build_transformations(&args)?;

    let store = open_store(config)?;
    let destination = Destination::open(&config.destination_dir)
        .context("destination is not prepared; run 'ezpump prepare' first")?;
    let db = destination.db()?;

    let mut options = config.sync_options();
    if args.defer_foreign_keys {
        options = options.with_deferred_foreign_keys();
    }
    let producer = QueryRows::new(args.table, store.repo(), args.query);
    let report = BatchSynchronizer::new(store.repo(), &db, options)
        .run(&producer, args.table, &transformations, &asset_columns)
        .with_context(|| format!("synchronization of {} failed", args.table))?;
    db.close()?;
    store.close()?;

    info!(table = %args.table, report = ?report, "sync finished");
    println!(
        "{}: {} read, {} inserted, {} updated, {} unchanged, {} conflicts, {} skipped, {} failed, {} assets",
        args.table,
        report.read,
        report.inserted,
        report.updated,
        report.unchanged,
        report.conflicts,
        report.skipped,
        report.failed,
        report.assets
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn args<'a>(values: &'a [String], renames: &'a [String], skip_empty: &'a [String]) -> SyncArgs<'a> {
        SyncArgs {
            table: "easydb.bilder",
            query: "SELECT 1",
            assets: &[],
            values,
            renames,
            skip_empty,
            defer_foreign_keys: false,
        }
    }

    #[test]
    fn test_parse_asset_column() {
        let column = parse_asset_column("fotos.bilder.datei=datei", "bilder").unwrap();
        assert_eq!(column.source_name, "fotos");
        assert_eq!(column.table, "bilder");
        assert_eq!(column.destination_table, "bilder");
        assert_eq!(column.destination_column, "datei");
        assert!(parse_asset_column("fotos.datei=datei", "bilder").is_err());
    }

    #[test]
    fn test_transformations_run_in_order() {
        let values = vec!["status=neu".to_string()];
        let renames = vec!["name=titel".to_string()];
        let skip = vec!["titel".to_string()];
        let transformations = build_transformations(&args(&values, &renames, &skip)).unwrap();
        assert_eq!(transformations.len(), 3);

        let row = Row::new().with("__source_unique_id", "1").with("name", "Hafen");
        let out = ezpump_etl::sync::apply_pipeline(&transformations, row).unwrap();
        assert_eq!(out[0].text("titel").as_deref(), Some("Hafen"));
        assert_eq!(out[0].text("status").as_deref(), Some("neu"));

        let empty = Row::new().with("__source_unique_id", "2");
        assert!(ezpump_etl::sync::apply_pipeline(&transformations, empty)
            .unwrap()
            .is_empty());
    }
}
