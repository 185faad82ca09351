//! `ezpump k10plus` command implementation
//!
//! Files are imported in order. Ctrl-C stops the run at the next item
//! boundary; the committed offset is kept, so the next run resumes there.

use super::open_store;
use crate::config::MigrationConfig;
use anyhow::Context;
use ezpump_etl::k10plus::{CancelFlag, K10plusImporter};
use std::path::PathBuf;
use tracing::{info, warn};

pub async fn run(
    config: &MigrationConfig,
    files: &[PathBuf],
    commit_every: Option<usize>,
    line_limit: Option<usize>,
) -> anyhow::Result<()> {
    for file in files {
        if !file.is_file() {
            anyhow::bail!("record file {} does not exist", file.display());
        }
    }
    let store = open_store(config)?;

    let cancel = CancelFlag::new();
    let signal_flag = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current item");
            signal_flag.cancel();
        }
    });

    let files = files.to_vec();
    let import = tokio::task::spawn_blocking(move || {
        let mut importer = K10plusImporter::new(&store).with_cancel_flag(cancel);
        if let Some(items) = commit_every {
            importer = importer.with_commit_every(items);
        }
        if let Some(lines) = line_limit {
            importer = importer.with_line_limit(lines);
        }
        let outcomes = importer.import_files(&files);
        let closed = store.close();
        outcomes.and_then(|outcomes| closed.map(|()| (files, outcomes)))
    })
    .await;
    signal.abort();

    let (files, outcomes) = import.context("K10plus import task failed")??;
    for (file, outcome) in files.iter().zip(&outcomes) {
        println!(
            "{}: {} items, {} rows ({} already imported)",
            file.display(),
            outcome.items,
            outcome.rows,
            outcome.skipped
        );
        if outcome.interrupted {
            info!(file = %file.display(), offset = outcome.token.offset, "line limit reached");
            println!("Line limit reached, stopping at item {}", outcome.token.offset);
        }
    }
    Ok(())
}
