//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod assets;
pub mod import;
pub mod init;
pub mod k10plus;
pub mod load;
pub mod prepare;
pub mod remove_source;
pub mod status;
pub mod sync;

use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::api::EasydbClient;
use ezpump_etl::intermediate::{InitMode, IntermediateStore};
use tracing::info;

/// Open the existing intermediate store
pub(crate) fn open_store(config: &MigrationConfig) -> anyhow::Result<IntermediateStore> {
    if !config.source_db.exists() {
        anyhow::bail!(
            "intermediate store {} does not exist; run 'ezpump init' first",
            config.source_db.display()
        );
    }
    IntermediateStore::prepare(&config.source_db, InitMode::Reuse)
        .with_context(|| format!("cannot open {}", config.source_db.display()))
}

/// Authenticated session against the target system
pub(crate) async fn connect(config: &MigrationConfig) -> anyhow::Result<EasydbClient> {
    let (url, login, password) = config.easydb_credentials()?;
    let api = EasydbClient::new(url, config.api_timeout_secs, config.verify_ssl)?;
    api.authenticate(login, password)
        .await
        .with_context(|| format!("authentication as '{}' at {} failed", login, url))?;
    info!(url = %url, login = %login, "authenticated");
    Ok(api)
}

/// Split `key=value`
pub(crate) fn split_pair(arg: &str) -> anyhow::Result<(&str, &str)> {
    arg.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .with_context(|| format!("expected 'key=value', got '{}'", arg))
}

/// Human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
