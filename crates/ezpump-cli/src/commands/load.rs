//! `ezpump load` command implementation

use super::{connect, open_store};
use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::api::EasClient;
use ezpump_etl::destination::Destination;
use ezpump_etl::loader::Loader;
use tracing::info;

/// Push destination rows of `objecttypes` (all types if empty)
pub async fn run(config: &MigrationConfig, objecttypes: &[String]) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let destination = Destination::open(&config.destination_dir)
        .context("destination is not prepared; run 'ezpump prepare' first")?;
    let api = connect(config).await?;

    let eas = match (&config.eas.url, &config.eas.instance) {
        (Some(url), Some(instance)) if config.search_assets => Some(EasClient::new(
            url.as_str(),
            instance.as_str(),
            config.api_timeout_secs,
            config.verify_ssl,
        )?),
        _ => None,
    };

    let mut loader = Loader::new(store.repo(), &destination, &api, config.load_options());
    if let Some(eas) = &eas {
        loader = loader.with_asset_index(eas);
    }
    let report = loader.load(objecttypes).await.context("load failed")?;
    store.close()?;

    info!(report = ?report, "load finished");
    println!(
        "Loaded {} records in {} batches ({} failed, {} skipped)",
        report.pushed, report.batches, report.failed, report.skipped
    );
    if report.failed > 0 {
        println!("Failed records stay without remote id; run 'ezpump load' again to retry them.");
    }
    Ok(())
}
