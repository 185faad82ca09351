//! `ezpump assets` command implementation
//!
//! Reads a listing CSV with one asset per line and stores each into the
//! filestore of the intermediate store.

use super::open_store;
use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::filestore::{AssetRequest, AssetStore, StorageMode};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// One line of the listing
#[derive(Debug, Deserialize)]
struct ListedAsset {
    source: String,
    table: String,
    column: String,
    id: String,
    location: String,
    #[serde(default)]
    modes: Option<String>,
    #[serde(default)]
    unique_id: Option<String>,
}

impl ListedAsset {
    fn request(&self) -> anyhow::Result<AssetRequest> {
        let mut request = AssetRequest::new(
            self.source.as_str(),
            self.table.as_str(),
            self.column.as_str(),
            self.id.as_str(),
            self.location.as_str(),
        );
        if let Some(modes) = self.modes.as_deref().filter(|m| !m.trim().is_empty()) {
            let modes = modes
                .split('|')
                .map(|m| m.trim().parse::<StorageMode>())
                .collect::<Result<Vec<_>, _>>()?;
            request = request.with_modes(modes);
        }
        if let Some(unique_id) = self.unique_id.as_deref().filter(|u| !u.is_empty()) {
            request = request.with_unique_id(unique_id);
        }
        Ok(request)
    }
}

fn read_listing(path: &Path) -> anyhow::Result<Vec<ListedAsset>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot read asset listing {}", path.display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, record)| record.with_context(|| format!("{}: invalid line {}", path.display(), i + 2)))
        .collect()
}

pub async fn run(config: &MigrationConfig, listing: &Path) -> anyhow::Result<()> {
    let assets = read_listing(listing)?;
    let store = open_store(config)?;
    let filestore = AssetStore::new(&store);

    let (mut stored, mut reused, mut missing) = (0usize, 0usize, 0usize);
    for asset in &assets {
        match filestore.store(&asset.request()?).await {
            Ok(Some(result)) if result.reused => reused += 1,
            Ok(Some(_)) => stored += 1,
            Ok(None) => {
                missing += 1;
                warn!(location = %asset.location, id = %asset.id, "asset not found");
            },
            Err(e) if !config.stop_on_error => {
                missing += 1;
                warn!(location = %asset.location, id = %asset.id, error = %e, "asset failed");
            },
            Err(e) => {
                return Err(e).with_context(|| format!("cannot store asset {}", asset.location));
            },
        }
    }
    store.close()?;

    info!(stored, reused, missing, "asset listing processed");
    println!(
        "Assets: {} stored, {} reused from filestore, {} missing",
        stored, reused, missing
    );
    Ok(())
}
