//! `ezpump status` command implementation
//!
//! Shows registered sources and filestore usage of the intermediate store,
//! and whether a destination is prepared.

use super::{format_bytes, open_store};
use crate::config::MigrationConfig;
use colored::Colorize;
use ezpump_etl::destination::Destination;

pub async fn run(config: &MigrationConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let sources = store.source_names()?;
    let stats = store.filestore_stats()?;
    store.close()?;

    println!("{}", "Intermediate store:".cyan().bold());
    println!("  Path:      {}", config.source_db.display());
    if sources.is_empty() {
        println!("  Sources:   none");
        println!("  Run 'ezpump import' to add a source.");
    } else {
        println!("  Sources:");
        for source in &sources {
            println!("    {}", source.green());
        }
    }
    println!(
        "  Filestore: {} files, {}",
        stats.files,
        format_bytes(stats.bytes.max(0) as u64)
    );
    println!();

    println!("{}", "Destination:".cyan().bold());
    println!("  Dir:       {}", config.destination_dir.display());
    match Destination::open(&config.destination_dir) {
        Ok(destination) if destination.exists() => {
            println!("  Store:     {}", destination.db_path().display());
            println!("  Types:     {}", destination.schema().objecttypes.len());
            println!("  Languages: {}", destination.languages().join(", "));
        },
        Ok(_) => println!("  Schema cached, store not created; run 'ezpump prepare'"),
        Err(_) => println!("  Not prepared; run 'ezpump prepare'"),
    }
    Ok(())
}
