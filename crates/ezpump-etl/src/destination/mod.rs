//! Destination store
//!
//! The destination directory holds everything the loader needs:
//!
//! - `schema.json`, the remote data model, fetched once and cached
//! - `l10n.json`, the database languages, fetched once and cached
//! - `destination.db`, the SQLite store with one table per object type
//! - `preloaded_assets.txt`, optional, one reusable asset id per line

pub mod datamodel;
pub mod schema;

pub use datamodel::{parse_languages, ColumnKind, ColumnType, EasydbColumn, EasydbSchema, ObjectType};
pub use schema::{DestinationSchema, SPECIAL_TYPES};

use crate::api::RemoteApi;
use crate::error::{EtlError, Result};
use crate::repository::{Repository, SqliteRepository, TableDefinition};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const EASYDB_ID: &str = "__easydb_id";
pub const EASYDB_GOID: &str = "__easydb_goid";

pub const DESTINATION_DB: &str = "destination.db";
pub const SCHEMA_FILE: &str = "schema.json";
pub const L10N_FILE: &str = "l10n.json";
pub const PRELOADED_ASSETS_FILE: &str = "preloaded_assets.txt";

pub fn object_table_name(objecttype: &str) -> String {
    format!("easydb.{}", objecttype)
}

pub fn asset_table_name(objecttype: &str, column: &str) -> String {
    format!("asset.{}.{}", objecttype, column)
}

pub fn tag_table_name(objecttype: &str) -> String {
    format!("tag.{}", objecttype)
}

pub fn user_table_name(name: &str) -> String {
    format!("user.{}", name)
}

pub fn l10n_column_name(column: &str, language: &str) -> String {
    format!("{}:{}", column, language)
}

/// When `destination.db` is (re)created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Delete and recreate on every prepare
    Always,
    #[default]
    IfNotExists,
    /// Fail if the store does not exist yet
    Never,
}

impl std::str::FromStr for CreatePolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "always" => Ok(CreatePolicy::Always),
            "if_not_exists" => Ok(CreatePolicy::IfNotExists),
            "never" => Ok(CreatePolicy::Never),
            other => Err(EtlError::config(format!(
                "unknown create policy '{}' (expected always, if_not_exists or never)",
                other
            ))),
        }
    }
}

pub struct Destination {
    dir: PathBuf,
    schema: EasydbSchema,
    tables: DestinationSchema,
    preloaded: Mutex<Option<HashSet<i64>>>,
}

impl Destination {
    /// Fetch (or reuse the cached) data model and create the store per `policy`
    pub async fn prepare(
        api: &dyn RemoteApi,
        dir: impl AsRef<Path>,
        policy: CreatePolicy,
        user_tables: &[TableDefinition],
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let schema_path = dir.join(SCHEMA_FILE);
        if !schema_path.exists() {
            let schema = api.schema().await?;
            std::fs::write(&schema_path, serde_json::to_vec_pretty(&schema)?)?;
            info!(path = %schema_path.display(), "cached remote schema");
        }
        let l10n_path = dir.join(L10N_FILE);
        if !l10n_path.exists() {
            let languages = parse_languages(&api.config().await?)?;
            std::fs::write(&l10n_path, serde_json::to_vec_pretty(&languages)?)?;
            info!(path = %l10n_path.display(), languages = ?languages, "cached database languages");
        }

        let destination = Self::open(dir)?;
        destination.create(policy, user_tables)?;
        Ok(destination)
    }

    /// Open a prepared destination directory from its cached files
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let schema_js = read_json(&dir.join(SCHEMA_FILE))?;
        let languages: Vec<String> = serde_json::from_value(read_json(&dir.join(L10N_FILE))?)?;
        let schema = EasydbSchema::parse(&schema_js)?;
        let tables = DestinationSchema::build(&schema, &languages)?;
        let preloaded = load_preloaded_assets(&dir.join(PRELOADED_ASSETS_FILE))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            schema,
            tables,
            preloaded: Mutex::new(preloaded),
        })
    }

    /// Create `destination.db` per `policy`; returns whether it was created
    pub fn create(&self, policy: CreatePolicy, user_tables: &[TableDefinition]) -> Result<bool> {
        let exists = self.exists();
        match (policy, exists) {
            (CreatePolicy::Never, false) => {
                return Err(EtlError::config(format!(
                    "destination store {} does not exist and create policy is 'never'",
                    self.db_path().display()
                )))
            },
            (CreatePolicy::Never, true) | (CreatePolicy::IfNotExists, true) => {
                debug!(path = %self.db_path().display(), "destination store exists");
                return Ok(false);
            },
            _ => {},
        }

        let repo = SqliteRepository::create(self.db_path())?;
        repo.create_schema(self.tables.definition())?;
        for table in user_tables {
            Self::create_user_table(&repo, table)?;
        }
        repo.close()?;
        info!(
            path = %self.db_path().display(),
            tables = self.tables.definition().tables.len(),
            user_tables = user_tables.len(),
            "created destination store"
        );
        Ok(true)
    }

    /// Create `table` as `user.<name>`
    pub fn create_user_table(repo: &dyn Repository, table: &TableDefinition) -> Result<()> {
        let mut definition = table.clone();
        definition.name = user_table_name(&table.name);
        repo.create_table(&definition)
    }

    pub fn exists(&self) -> bool {
        self.db_path().exists()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(DESTINATION_DB)
    }

    /// Open a connection to `destination.db` for one unit of work
    pub fn db(&self) -> Result<SqliteRepository> {
        if !self.exists() {
            return Err(EtlError::config(format!(
                "destination store {} has not been created",
                self.db_path().display()
            )));
        }
        SqliteRepository::open(self.db_path())
    }

    pub fn schema(&self) -> &EasydbSchema {
        &self.schema
    }

    pub fn tables(&self) -> &DestinationSchema {
        &self.tables
    }

    pub fn languages(&self) -> &[String] {
        self.tables.languages()
    }

    pub fn objecttype(&self, name: &str) -> Result<&ObjectType> {
        self.schema.require_objecttype(name)
    }

    pub fn table_for_objecttype(&self, name: &str) -> Result<&TableDefinition> {
        self.tables
            .table_for_objecttype(name)
            .ok_or_else(|| EtlError::TableNotFound(object_table_name(name)))
    }

    /// Whether a found asset id may be reused
    ///
    /// Without a preloaded asset list every id may be reused. With one, an id
    /// may be reused once and only if it is listed.
    pub fn consume_asset(&self, id: i64) -> bool {
        let mut preloaded = self
            .preloaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match preloaded.as_mut() {
            None => true,
            Some(ids) => ids.remove(&id),
        }
    }
}

fn read_json(path: &Path) -> Result<JsonValue> {
    if !path.exists() {
        return Err(EtlError::config(format!(
            "{} not found, prepare the destination first",
            path.display()
        )));
    }
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

fn load_preloaded_assets(path: &Path) -> Result<Option<HashSet<i64>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut ids = HashSet::new();
    for (n, line) in std::fs::read_to_string(path)?.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<i64>() {
            Ok(id) => {
                ids.insert(id);
            },
            Err(_) => warn!(path = %path.display(), line = n + 1, value = line, "invalid asset id"),
        }
    }
    info!(path = %path.display(), assets = ids.len(), "loaded preloaded assets");
    Ok(Some(ids))
}
