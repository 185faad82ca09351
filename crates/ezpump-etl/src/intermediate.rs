//! Intermediate store lifecycle
//!
//! One SQLite file per migration job holds the provenance registry, the
//! content-addressed filestore, the K10plus tables and one shadow table per
//! imported foreign table.

use crate::error::Result;
use crate::repository::{quote_name, Repository, SqliteRepository, Transaction};
use crate::value::Value;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// Base tables
// ============================================================================

pub const ORIGIN_TABLE: &str = "origin";
pub const FILESTORE_TABLE: &str = "filestore";
pub const FILE_TABLE: &str = "file";
pub const K10PLUS_SOURCE_TABLE: &str = "k10plus_source";
pub const K10PLUS_DATA_TABLE: &str = "k10plus_data";

const ORIGIN_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS origin (
        origin_id INTEGER PRIMARY KEY,
        origin_type TEXT NOT NULL,
        origin_database_name TEXT NOT NULL,
        origin_table_name TEXT NOT NULL,
        source_name TEXT NOT NULL,
        source_table_name TEXT NOT NULL,
        UNIQUE(origin_type, origin_database_name, origin_table_name),
        UNIQUE(source_name, source_table_name)
    )
"#;

const K10PLUS_DDL: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS k10plus_source (
        filename TEXT NOT NULL,
        "offset" INTEGER NOT NULL,
        from_item_id INTEGER,
        to_item_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS k10plus_data (
        id INTEGER PRIMARY KEY,
        item_id INTEGER NOT NULL,
        feld TEXT NOT NULL,
        unterfeld TEXT NOT NULL,
        wert TEXT NOT NULL
    )
    "#,
];

const FILESTORE_DDL: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS filestore (
        filestore_id INTEGER PRIMARY KEY,
        unique_id TEXT NOT NULL UNIQUE,
        original_filename TEXT,
        mimetype TEXT,
        filesize INTEGER,
        url TEXT,
        filename TEXT,
        data BLOB
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file (
        file_id INTEGER PRIMARY KEY,
        filestore_id INTEGER NOT NULL,
        source_name TEXT NOT NULL,
        source_table_name TEXT NOT NULL,
        source_column_name TEXT NOT NULL,
        source_unique_id TEXT NOT NULL,
        origin_url TEXT,
        eas_id INTEGER,
        eas_root_id INTEGER,
        file_version TEXT,
        UNIQUE(eas_id, file_version),
        FOREIGN KEY (filestore_id) REFERENCES filestore(filestore_id) ON DELETE RESTRICT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS file_idx ON file (
        source_name,
        source_table_name,
        source_column_name,
        source_unique_id
    )
    "#,
];

/// How an existing store file is treated when a job starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Delete the file and create all base tables
    #[default]
    Fresh,
    /// Keep `filestore` and `file`, remove every registered source
    KeepFilestore,
    /// Open as is, creating only missing base tables
    Reuse,
}

impl std::str::FromStr for InitMode {
    type Err = crate::error::EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fresh" | "init" => Ok(InitMode::Fresh),
            "keep-filestore" | "keep_filestore" => Ok(InitMode::KeepFilestore),
            "reuse" => Ok(InitMode::Reuse),
            other => Err(crate::error::EtlError::config(format!(
                "unknown init mode '{}' (expected fresh, keep-filestore or reuse)",
                other
            ))),
        }
    }
}

/// Number of filestore rows and their summed size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilestoreStats {
    pub files: i64,
    pub bytes: i64,
}

/// Handle on the intermediate SQLite file
#[derive(Debug)]
pub struct IntermediateStore {
    repo: SqliteRepository,
}

impl IntermediateStore {
    /// Open the store at `path` according to `mode`
    pub fn prepare(path: impl AsRef<Path>, mode: InitMode) -> Result<Self> {
        let path = path.as_ref();
        let repo = match mode {
            InitMode::Fresh => {
                info!(path = %path.display(), "creating intermediate store");
                SqliteRepository::create(path)?
            },
            InitMode::KeepFilestore | InitMode::Reuse => {
                info!(path = %path.display(), mode = ?mode, "opening intermediate store");
                SqliteRepository::open(path)?
            },
        };
        let store = Self { repo };
        store.create_base_tables()?;

        if mode == InitMode::KeepFilestore {
            let stats = store.filestore_stats()?;
            info!(
                files = stats.files,
                bytes = stats.bytes,
                "keeping filestore, removing all registered sources"
            );
            for source in store.source_names()? {
                store.remove_source(&source, true)?;
            }
        }
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            repo: SqliteRepository::open_in_memory()?,
        };
        store.create_base_tables()?;
        Ok(store)
    }

    pub fn repo(&self) -> &SqliteRepository {
        &self.repo
    }

    pub fn close(&self) -> Result<()> {
        self.repo.close()
    }

    fn create_base_tables(&self) -> Result<()> {
        let tx = Transaction::begin(&self.repo)?;
        for ddl in std::iter::once(ORIGIN_DDL)
            .chain(K10PLUS_DDL)
            .chain(FILESTORE_DDL)
        {
            self.repo.execute(ddl, &[])?;
        }
        tx.commit()
    }

    /// Distinct source names registered in `origin`
    pub fn source_names(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .query(
                "SELECT DISTINCT source_name FROM origin ORDER BY source_name",
                &[],
            )?
            .iter()
            .filter_map(|row| row.text("source_name"))
            .collect())
    }

    pub fn filestore_stats(&self) -> Result<FilestoreStats> {
        let row = self.repo.query_one(
            "SELECT count(filestore_id) AS files, coalesce(sum(filesize), 0) AS bytes FROM filestore",
            &[],
        )?;
        Ok(row
            .map(|r| FilestoreStats {
                files: r.integer("files").unwrap_or(0),
                bytes: r.integer("bytes").unwrap_or(0),
            })
            .unwrap_or_default())
    }

    /// Remove every shadow table, provenance row and (optionally) file of a source
    ///
    /// Filestore rows are only deleted once no `file` row references them.
    pub fn remove_source(&self, name: &str, keep_filestore: bool) -> Result<()> {
        info!(source = %name, keep_filestore, "removing source");
        let tx = Transaction::begin(&self.repo)?;
        let params = [Value::from(name)];

        let tables = self.repo.query(
            "SELECT source_name, source_table_name FROM origin WHERE source_name = ?1",
            &params,
        )?;
        for row in &tables {
            let shadow = shadow_table_name(
                &row.text("source_name").unwrap_or_default(),
                &row.text("source_table_name").unwrap_or_default(),
            );
            self.repo.execute(
                &format!("DROP TABLE IF EXISTS {}", quote_name(&shadow)),
                &[],
            )?;
        }

        if !keep_filestore {
            let files = self
                .repo
                .execute("DELETE FROM file WHERE source_name = ?1", &params)?;
            let blobs = self.repo.execute(
                "DELETE FROM filestore WHERE filestore_id NOT IN (SELECT filestore_id FROM file)",
                &[],
            )?;
            info!(source = %name, files, blobs, "removed files of source");
        }

        let origins = self
            .repo
            .execute("DELETE FROM origin WHERE source_name = ?1", &params)?;
        if origins == 0 {
            warn!(source = %name, "no origin registered for source");
        }
        tx.commit()
    }
}

/// Shadow table name for a foreign table: `"<source>.<table>"`
pub fn shadow_table_name(source_name: &str, table_name: &str) -> String {
    format!("{}.{}", source_name, table_name)
}
