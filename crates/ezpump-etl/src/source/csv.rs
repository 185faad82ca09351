//! CSV files as a foreign source
//!
//! Each file is one table named after its file stem, with text columns taken
//! from the header row. CSV tables have no key unless one is configured.

use super::{ForeignColumn, ForeignSource, ForeignTable, PageRequest};
use crate::error::{EtlError, Result};
use crate::value::{Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct CsvSource {
    name: String,
    files: Vec<PathBuf>,
    delimiter: u8,
    cache: Mutex<HashMap<String, Arc<Vec<Row>>>>,
}

impl CsvSource {
    /// A single `.csv` file or a directory of them
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .map(|e| e.eq_ignore_ascii_case("csv"))
                        .unwrap_or(false)
                })
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(EtlError::config(format!(
                "CSV source not found: {}",
                path.display()
            )));
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            files,
            delimiter: b',',
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn table_name(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn reader(&self, path: &Path) -> Result<::csv::Reader<std::fs::File>> {
        Ok(::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(path)?)
    }

    /// All rows of a file, parsed once
    fn rows(&self, table: &ForeignTable) -> Result<Arc<Vec<Row>>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(rows) = cache.get(&table.name) {
                return Ok(Arc::clone(rows));
            }
        }
        let path = self
            .files
            .iter()
            .find(|p| Self::table_name(p) == table.name)
            .ok_or_else(|| EtlError::TableNotFound(table.name.clone()))?;

        let mut reader = self.reader(path)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Row = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let value = record
                        .get(i)
                        .filter(|v| !v.is_empty())
                        .map(Value::from)
                        .unwrap_or(Value::Null);
                    (c.name.clone(), value)
                })
                .collect();
            rows.push(row);
        }
        debug!(table = %table.name, rows = rows.len(), "read CSV file");

        let rows = Arc::new(rows);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(table.name.clone(), Arc::clone(&rows));
        }
        Ok(rows)
    }
}

#[async_trait]
impl ForeignSource for CsvSource {
    fn origin_type(&self) -> &str {
        "csv"
    }

    fn database_name(&self) -> &str {
        &self.name
    }

    async fn tables(&self) -> Result<Vec<ForeignTable>> {
        let mut tables = Vec::with_capacity(self.files.len());
        for path in &self.files {
            let mut reader = self.reader(path)?;
            let columns = reader
                .headers()?
                .iter()
                .map(|h| ForeignColumn::new(h.trim(), "text"))
                .collect();
            tables.push(ForeignTable {
                name: Self::table_name(path),
                columns,
                primary_key: Vec::new(),
            });
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    async fn fetch_page(&self, table: &ForeignTable, page: &PageRequest) -> Result<Vec<Row>> {
        if page.filter.is_some() || page.order_by.is_some() {
            return Err(EtlError::config(format!(
                "CSV table '{}' supports neither 'where' nor 'orderby'",
                table.name
            )));
        }
        let rows = self.rows(table)?;
        if page.key.is_empty() {
            return Ok(rows.iter().skip(page.offset).take(page.limit).cloned().collect());
        }

        let mut sorted: Vec<&Row> = rows.iter().collect();
        sorted.sort_by(|a, b| {
            let ka: Vec<Option<String>> = page.key.iter().map(|k| a.text(k)).collect();
            let kb: Vec<Option<String>> = page.key.iter().map(|k| b.text(k)).collect();
            ka.cmp(&kb)
        });
        Ok(sorted
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}
