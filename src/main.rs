//! opsmirror - mirror remote document databases into SQLite and manage
//! disposable named environments of that mirror.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use opsmirror::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "opsmirror=debug,tower_http=debug"
    } else {
        "info,tower_http=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        #[cfg(feature = "server")]
        Commands::Serve {
            host,
            port,
            no_schedule,
        } => {
            cli::run_serve(config, host, port, no_schedule).await?;
        }
        Commands::Sync { env } => {
            cli::run_sync(&config, env).await?;
        }
        Commands::Env { command } => {
            cli::run_env(&config, command)?;
        }
        Commands::Config { init } => {
            cli::run_config(&config, cli.config, init)?;
        }
    }

    Ok(())
}
