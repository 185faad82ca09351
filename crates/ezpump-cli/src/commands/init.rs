//! `ezpump init` command implementation

use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::intermediate::{InitMode, IntermediateStore};
use tracing::info;

/// Create or reset the intermediate store
pub async fn run(config: &MigrationConfig, mode: &str) -> anyhow::Result<()> {
    let mode: InitMode = mode.parse()?;
    let store = IntermediateStore::prepare(&config.source_db, mode)
        .with_context(|| format!("cannot prepare {}", config.source_db.display()))?;
    let stats = store.filestore_stats()?;
    store.close()?;

    info!(path = %config.source_db.display(), mode = ?mode, files = stats.files, "intermediate store ready");
    println!(
        "Intermediate store ready: {} ({} files kept)",
        config.source_db.display(),
        stats.files
    );
    Ok(())
}
