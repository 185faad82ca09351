//! Batched, versioned upsert into one destination table

use super::assets::{attach_assets, AssetColumn};
use super::producer::RowProducer;
use super::transform::{apply_pipeline, RowTransformation};
use super::{SyncOptions, SyncReport, DEFAULT_VERSION, FILE_TABLE_ID, VERSION};
use crate::error::{EtlError, Result};
use crate::repository::{quote_name, Repository, Transaction};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::value::{Row, Value};
use std::collections::HashMap;
use tracing::{debug, error, info};

/// Statement parameters per existence check; stays below SQLite's variable limit
const CHECK_CHUNK: usize = 500;

/// Rows of one batch keyed by source id, in arrival order
#[derive(Default)]
struct Batch {
    rows: Vec<(String, Row)>,
    index: HashMap<String, usize>,
}

impl Batch {
    /// Add a row; a second row with the same id replaces the first in place
    fn add(&mut self, source_id: String, row: Row) {
        match self.index.get(&source_id) {
            Some(&i) => {
                debug!(source_id = %source_id, "source id repeated in batch, last row wins");
                self.rows[i].1 = row;
            },
            None => {
                self.index.insert(source_id.clone(), self.rows.len());
                self.rows.push((source_id, row));
            },
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// What the version check decided for one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Insert,
    Update,
}

pub struct BatchSynchronizer<'a> {
    source: &'a dyn Repository,
    destination: &'a dyn Repository,
    options: SyncOptions,
}

impl<'a> BatchSynchronizer<'a> {
    /// `source` holds the `file`/`filestore` tables, `destination` the target tables
    pub fn new(source: &'a dyn Repository, destination: &'a dyn Repository, options: SyncOptions) -> Self {
        Self {
            source,
            destination,
            options,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Synchronize every row of `producer` into `table`
    pub fn run(
        &self,
        producer: &dyn RowProducer,
        table: &str,
        transformations: &[Box<dyn RowTransformation>],
        asset_columns: &[AssetColumn],
    ) -> Result<SyncReport> {
        let mut names = vec![table.to_string()];
        names.extend(asset_columns.iter().map(AssetColumn::asset_table));
        self.destination
            .schema()?
            .require_tables(names.iter().map(String::as_str))?;

        info!(producer = producer.name(), table, "synchronize begin");
        let mut report = SyncReport::default();

        // Deferred mode: one transaction for the whole run, foreign keys checked at the end
        let run_tx = if self.options.defer_foreign_keys {
            info!(table, "defer foreign keys");
            Some(Transaction::begin_deferred(self.destination)?)
        } else {
            None
        };

        let mut batch = Batch::default();
        for row in producer.rows()? {
            report.read += 1;
            for row in apply_pipeline(transformations, row)? {
                report.produced += 1;
                let Some(source_id) = row.get(SOURCE_UNIQUE_ID).and_then(|v| v.as_text()) else {
                    error!(producer = producer.name(), batch = report.batches, "row does not contain \"__source_unique_id\"");
                    if self.options.stop_on_error {
                        return Err(EtlError::MissingSourceId(row.to_json().to_string()));
                    }
                    report.skipped += 1;
                    continue;
                };
                batch.add(source_id, row);
                if batch.len() >= self.options.batch_size.max(1) {
                    self.flush(std::mem::take(&mut batch), table, asset_columns, run_tx.is_some(), &mut report)?;
                }
            }
        }
        if !batch.is_empty() {
            self.flush(batch, table, asset_columns, run_tx.is_some(), &mut report)?;
        }

        if let Some(tx) = run_tx {
            tx.commit().inspect_err(|e| {
                error!(table, error = %e, "integrity error, most probably __parent_id / __uplink_id constraint violated");
            })?;
        }

        info!(
            producer = producer.name(),
            table,
            read = report.read,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            conflicts = report.conflicts,
            failed = report.failed,
            assets = report.assets,
            "synchronize end"
        );
        Ok(report)
    }

    fn flush(
        &self,
        batch: Batch,
        table: &str,
        asset_columns: &[AssetColumn],
        in_run_tx: bool,
        report: &mut SyncReport,
    ) -> Result<()> {
        report.batches += 1;
        let tx = if in_run_tx {
            None
        } else {
            Some(Transaction::begin(self.destination)?)
        };

        self.process_batch(batch, table, asset_columns, report)?;

        if let Some(tx) = tx {
            tx.commit()?;
        }
        Ok(())
    }

    fn process_batch(
        &self,
        batch: Batch,
        table: &str,
        asset_columns: &[AssetColumn],
        report: &mut SyncReport,
    ) -> Result<()> {
        let stored = self.stored_versions(table, &batch)?;

        let mut actions: Vec<(String, Row, Action)> = Vec::with_capacity(batch.len());
        for (source_id, mut row) in batch.rows {
            let incoming = row
                .get(VERSION)
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_VERSION);
            row.set(VERSION, incoming);

            let action = match stored.get(&source_id) {
                None => Action::Insert,
                Some(&current) if current == incoming => {
                    report.unchanged += 1;
                    continue;
                },
                Some(&current) if current > incoming => {
                    error!(table, source_id = %source_id, stored = current, incoming, "stored version is newer than incoming");
                    if self.options.stop_on_error {
                        return Err(EtlError::VersionConflict {
                            source_id,
                            stored: current,
                            incoming,
                        });
                    }
                    report.conflicts += 1;
                    continue;
                },
                Some(_) => Action::Update,
            };
            actions.push((source_id, row, action));
        }

        debug!(table, rows = actions.len(), "insert/update");
        for (source_id, mut row, action) in actions {
            let file_table_id = row
                .remove(FILE_TABLE_ID)
                .and_then(|v| v.as_text())
                .unwrap_or_else(|| source_id.clone());

            let outcome = match action {
                Action::Update => {
                    let key = Row::new().with(SOURCE_UNIQUE_ID, source_id.as_str());
                    self.destination.update_row(table, &row, &key).map(|_| 0)
                },
                Action::Insert => self.destination.insert_row(table, &row).and_then(|_| {
                    let mut attached = 0;
                    for column in asset_columns {
                        attached += attach_assets(self.source, self.destination, column, &file_table_id, &source_id)?;
                    }
                    Ok(attached)
                }),
            };

            match outcome {
                Ok(attached) => {
                    match action {
                        Action::Insert => report.inserted += 1,
                        Action::Update => report.updated += 1,
                    }
                    report.assets += attached;
                },
                Err(e) => {
                    error!(table, source_id = %source_id, row = %row.to_json(), error = %e, "error when inserting/updating row");
                    if self.options.stop_on_error || e.is_fatal() {
                        return Err(e);
                    }
                    report.failed += 1;
                },
            }
        }
        Ok(())
    }

    /// Stored `__version` per source id of the batch; null counts as 1
    fn stored_versions(&self, table: &str, batch: &Batch) -> Result<HashMap<String, i64>> {
        let ids: Vec<&String> = batch.rows.iter().map(|(id, _)| id).collect();
        let mut stored = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(CHECK_CHUNK) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {uid}, {version} FROM {table} WHERE {uid} IN ({placeholders})",
                uid = quote_name(SOURCE_UNIQUE_ID),
                version = quote_name(VERSION),
                table = quote_name(table),
                placeholders = placeholders
            );
            let params: Vec<Value> = chunk.iter().map(|id| Value::from(id.as_str())).collect();
            for row in self.destination.query(&sql, &params)? {
                if let Some(id) = row.text(SOURCE_UNIQUE_ID) {
                    stored.insert(id, row.integer(VERSION).unwrap_or(DEFAULT_VERSION));
                }
            }
        }
        Ok(stored)
    }
}
