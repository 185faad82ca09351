//! Job configuration
//!
//! Values come from the environment (and a `.env` file), then command-line
//! flags override them.

use anyhow::{bail, Context};
use ezpump_etl::api::DEFAULT_API_TIMEOUT_SECS;
use ezpump_etl::loader::{LoadOptions, DEFAULT_LOAD_BATCH_SIZE};
use ezpump_etl::source::DEFAULT_PAGE_SIZE;
use ezpump_etl::sync::SyncOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Defaults
// ============================================================================

/// Default path of the intermediate store.
pub const DEFAULT_SOURCE_DB: &str = "source.sqlite";

/// Default destination directory (schema cache and `destination.db`).
pub const DEFAULT_DESTINATION_DIR: &str = "destination";

/// Default number of source ids per batch (sync and load).
pub const DEFAULT_BATCH_SIZE: usize = DEFAULT_LOAD_BATCH_SIZE;

/// Default number of rows per page when reading a foreign table.
pub const DEFAULT_IMPORT_PAGE_SIZE: usize = DEFAULT_PAGE_SIZE;

/// Default request timeout against the target system in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = DEFAULT_API_TIMEOUT_SECS;

/// Target system connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EasydbConfig {
    pub url: Option<String>,
    pub login: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

/// Asset server used for lookups by fingerprint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EasConfig {
    pub url: Option<String>,
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub source_db: PathBuf,
    pub destination_dir: PathBuf,
    pub easydb: EasydbConfig,
    pub eas: EasConfig,
    pub batch_size: usize,
    pub page_size: usize,
    pub stop_on_error: bool,
    pub search_assets: bool,
    pub verify_ssl: bool,
    pub asset_dir: Option<PathBuf>,
    pub api_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_db: PathBuf::from(DEFAULT_SOURCE_DB),
            destination_dir: PathBuf::from(DEFAULT_DESTINATION_DIR),
            easydb: EasydbConfig::default(),
            eas: EasConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_IMPORT_PAGE_SIZE,
            stop_on_error: true,
            search_assets: true,
            verify_ssl: true,
            asset_dir: None,
            api_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// `true`/`false`, `1`/`0`, `yes`/`no`, `on`/`off`
fn parse_flag(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", key, other),
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number, got '{}'", key, value))
}

impl MigrationConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("EZPUMP_SOURCE_DB") {
            config.source_db = PathBuf::from(path);
        }
        if let Some(dir) = lookup("EZPUMP_DESTINATION_DIR") {
            config.destination_dir = PathBuf::from(dir);
        }
        config.easydb = EasydbConfig {
            url: lookup("EZPUMP_EASYDB_URL"),
            login: lookup("EZPUMP_EASYDB_LOGIN"),
            password: lookup("EZPUMP_EASYDB_PASSWORD"),
        };
        config.eas = EasConfig {
            url: lookup("EZPUMP_EAS_URL"),
            instance: lookup("EZPUMP_EAS_INSTANCE"),
        };
        if let Some(v) = lookup("EZPUMP_BATCH_SIZE") {
            config.batch_size = parse_number("EZPUMP_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("EZPUMP_PAGE_SIZE") {
            config.page_size = parse_number("EZPUMP_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("EZPUMP_STOP_ON_ERROR") {
            config.stop_on_error = parse_flag("EZPUMP_STOP_ON_ERROR", &v)?;
        }
        if let Some(v) = lookup("EZPUMP_SEARCH_ASSETS") {
            config.search_assets = parse_flag("EZPUMP_SEARCH_ASSETS", &v)?;
        }
        if let Some(v) = lookup("EZPUMP_VERIFY_SSL") {
            config.verify_ssl = parse_flag("EZPUMP_VERIFY_SSL", &v)?;
        }
        config.asset_dir = lookup("EZPUMP_ASSET_DIR").map(PathBuf::from);
        if let Some(v) = lookup("EZPUMP_API_TIMEOUT_SECS") {
            config.api_timeout_secs = parse_number("EZPUMP_API_TIMEOUT_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            bail!("Batch size must be greater than 0");
        }
        if self.page_size == 0 {
            bail!("Page size must be greater than 0");
        }
        if self.api_timeout_secs == 0 {
            bail!("API timeout must be greater than 0");
        }
        if self.source_db.as_os_str().is_empty() {
            bail!("Source store path cannot be empty");
        }
        if self.eas.url.is_some() && self.eas.instance.is_none() {
            bail!("EZPUMP_EAS_URL is set but EZPUMP_EAS_INSTANCE is missing");
        }
        if !self.verify_ssl {
            tracing::warn!("SSL certificate verification is disabled");
        }
        Ok(())
    }

    /// Target system url, login and password; every remote job needs all three
    pub fn easydb_credentials(&self) -> anyhow::Result<(&str, &str, &str)> {
        let (Some(url), Some(login), Some(password)) = (
            self.easydb.url.as_deref(),
            self.easydb.login.as_deref(),
            self.easydb.password.as_deref(),
        ) else {
            bail!("EZPUMP_EASYDB_URL, EZPUMP_EASYDB_LOGIN and EZPUMP_EASYDB_PASSWORD are required for this command");
        };
        Ok((url, login, password))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions::default()
            .with_batch_size(self.batch_size)
            .with_stop_on_error(self.stop_on_error)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            batch_size: self.batch_size,
            stop_on_error: self.stop_on_error,
            search_assets: self.search_assets,
            verify_ssl: self.verify_ssl,
            asset_dir: self.asset_dir.clone(),
            timeout_secs: self.api_timeout_secs,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.source_db, PathBuf::from(DEFAULT_SOURCE_DB));
        assert_eq!(config.batch_size, 1000);
        assert!(config.stop_on_error && config.search_assets && config.verify_ssl);
        assert!(config.easydb_credentials().is_err());
    }

    #[test]
    fn test_environment_values() {
        let config = MigrationConfig::from_lookup(lookup(&[
            ("EZPUMP_SOURCE_DB", "/data/job.sqlite"),
            ("EZPUMP_EASYDB_URL", "https://easydb.example.org"),
            ("EZPUMP_EASYDB_LOGIN", "root"),
            ("EZPUMP_EASYDB_PASSWORD", "secret"),
            ("EZPUMP_BATCH_SIZE", "250"),
            ("EZPUMP_STOP_ON_ERROR", "no"),
            ("EZPUMP_ASSET_DIR", "/data/scans"),
        ]))
        .unwrap();

        assert_eq!(config.source_db, PathBuf::from("/data/job.sqlite"));
        assert_eq!(
            config.easydb_credentials().unwrap(),
            ("https://easydb.example.org", "root", "secret")
        );
        let load = config.load_options();
        assert_eq!(load.batch_size, 250);
        assert!(!load.stop_on_error);
        assert_eq!(load.asset_dir, Some(PathBuf::from("/data/scans")));
        assert_eq!(config.sync_options().batch_size, 250);
    }

    #[test]
    fn test_invalid_values() {
        assert!(MigrationConfig::from_lookup(lookup(&[("EZPUMP_BATCH_SIZE", "0")])).is_err());
        assert!(MigrationConfig::from_lookup(lookup(&[("EZPUMP_BATCH_SIZE", "many")])).is_err());
        assert!(MigrationConfig::from_lookup(lookup(&[("EZPUMP_VERIFY_SSL", "maybe")])).is_err());
        assert!(MigrationConfig::from_lookup(lookup(&[("EZPUMP_EAS_URL", "http://eas")])).is_err());
    }

    #[test]
    fn test_password_is_not_serialized() {
        let mut config = MigrationConfig::default();
        config.easydb.password = Some("secret".into());
        let js = serde_json::to_string(&config).unwrap();
        assert!(!js.contains("secret"));
    }
}
