//! ezpump CLI - Main entry point

use clap::Parser;
use ezpump_cli::commands::{self, sync::SyncArgs};
use ezpump_cli::{Cli, Commands, MigrationConfig};
use ezpump_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use ezpump_common::timing::JobTimer;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Verbose mode logs debug events; otherwise only warnings reach the console
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("ezpump")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok().flatten();

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init { .. } => "init",
        Commands::Import { .. } => "import",
        Commands::K10plus { .. } => "k10plus",
        Commands::Assets { .. } => "assets",
        Commands::RemoveSource { .. } => "remove-source",
        Commands::Prepare { .. } => "prepare",
        Commands::Sync { .. } => "sync",
        Commands::Load { .. } => "load",
        Commands::Status => "status",
    }
}

/// Execute the CLI command
async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.apply(MigrationConfig::from_env()?)?;
    let timer = JobTimer::start(command_name(&cli.command));

    let result = match &cli.command {
        Commands::Init { mode } => commands::init::run(&config, mode).await,

        Commands::Import { source } => commands::import::run(&config, source).await,

        Commands::K10plus {
            files,
            commit_every,
            line_limit,
        } => commands::k10plus::run(&config, files, *commit_every, *line_limit).await,

        Commands::Assets { listing } => commands::assets::run(&config, listing).await,

        Commands::RemoveSource {
            name,
            keep_filestore,
        } => commands::remove_source::run(&config, name, *keep_filestore).await,

        Commands::Prepare {
            policy,
            user_tables,
        } => commands::prepare::run(&config, policy, user_tables.as_deref()).await,

        Commands::Sync {
            table,
            query,
            assets,
            values,
            renames,
            skip_empty,
            defer_foreign_keys,
        } => {
            commands::sync::run(
                &config,
                SyncArgs {
                    table,
                    query,
                    assets,
                    values,
                    renames,
                    skip_empty,
                    defer_foreign_keys: *defer_foreign_keys,
                },
            )
            .await
        },

        Commands::Load { objecttypes } => commands::load::run(&config, objecttypes).await,

        Commands::Status => commands::status::run(&config).await,
    };

    timer.finish();
    result
}
