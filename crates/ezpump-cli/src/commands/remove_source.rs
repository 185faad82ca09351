//! `ezpump remove-source` command implementation

use super::open_store;
use crate::config::MigrationConfig;
use tracing::info;

pub async fn run(config: &MigrationConfig, name: &str, keep_filestore: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if !store.source_names()?.iter().any(|s| s == name) {
        anyhow::bail!("source '{}' is not registered in {}", name, config.source_db.display());
    }
    store.remove_source(name, keep_filestore)?;
    store.close()?;

    info!(source = %name, keep_filestore, "source removed");
    println!("Removed source '{}'", name);
    Ok(())
}
