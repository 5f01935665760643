//! CLI command definitions and handlers

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use opsmirror::clock::{Clock, SystemClock};
use opsmirror::config::Config;
use opsmirror::env::{ContextResolver, DeleteOutcome, EnvironmentRegistry, SeedMode};
use opsmirror::store::Store;
use opsmirror::sync::{
    FetchPolicy, HttpDocumentApi, PageFetcher, ProgressTracker, SyncOrchestrator, SyncSource,
};

#[derive(Parser)]
#[command(name = "opsmirror")]
#[command(
    author,
    version,
    about = "Incremental document mirror with disposable named environments"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/opsmirror/config.toml)
    #[arg(short, long, global = true, env = "OPSMIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP surface, the TTL watcher and scheduled sync
    #[cfg(feature = "server")]
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not run scheduled sync passes
        #[arg(long)]
        no_schedule: bool,
    },

    /// Run one sync-all pass
    Sync {
        /// Target environment (default: production)
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Manage named environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
pub enum EnvCommands {
    /// Create a named environment
    Create {
        name: String,

        /// empty, production or fixtures
        #[arg(short, long, default_value = "empty")]
        seed: SeedMode,

        /// Lifetime in seconds (default: from config)
        #[arg(short, long)]
        ttl: Option<i64>,
    },

    /// Show one environment
    Get { name: String },

    /// List live environments
    List,

    /// Delete an environment
    Delete { name: String },

    /// Remove expired environments, orphaned stores and dangling records
    Cleanup,
}

/// Stores, registry and resolver for one process
pub struct Services {
    pub production: Store,
    pub registry: Arc<EnvironmentRegistry>,
    pub resolver: Arc<ContextResolver>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn open(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let production = Store::open(config.production_db_path(), config.busy_timeout())
            .with_context(|| {
                format!(
                    "failed to open production store at {}",
                    config.production_db_path().display()
                )
            })?;
        let registry = Arc::new(
            EnvironmentRegistry::open(
                config.environments_path(),
                Some(production.clone()),
                clock.clone(),
                config.busy_timeout(),
                config.environments.max_ttl_secs,
            )
            .context("failed to open environment registry")?,
        );
        let resolver = Arc::new(ContextResolver::new(production.clone(), registry.clone()));

        Ok(Self {
            production,
            registry,
            resolver,
            clock,
        })
    }
}

/// Build the orchestrator. A missing API token is fatal.
pub fn build_orchestrator(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<SyncOrchestrator<HttpDocumentApi>> {
    let token = config.api_token()?;
    let api = HttpDocumentApi::new(&config.api, &token)?;
    let sources: Vec<SyncSource> = config
        .source_ids()
        .into_iter()
        .map(|(kind, source_id)| SyncSource { kind, source_id })
        .collect();
    if sources.is_empty() {
        warn!("no source databases configured; sync passes will do nothing");
    }

    let progress = Arc::new(ProgressTracker::new(
        chrono::Duration::seconds(config.environments.progress_retention_secs),
        clock.clone(),
    ));
    Ok(SyncOrchestrator::new(
        PageFetcher::new(api, FetchPolicy::from(&config.api)),
        sources,
        progress,
        clock,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run one sync-all pass against production or a named environment
pub async fn run_sync(config: &Config, env: Option<String>) -> Result<()> {
    let services = Services::open(config)?;
    let orchestrator = build_orchestrator(config, services.clock.clone())?;

    let resolver = services.resolver.clone();
    let scoped = tokio::task::spawn_blocking(move || resolver.resolve(env.as_deref())).await??;

    let report = orchestrator.sync_all(&scoped.store).await;
    print_json(&report)?;

    if report.failed() > 0 {
        bail!("{} of {} sync passes failed", report.failed(), report.passes.len());
    }
    Ok(())
}

pub fn run_env(config: &Config, command: EnvCommands) -> Result<()> {
    let services = Services::open(config)?;
    let registry = &services.registry;

    match command {
        EnvCommands::Create { name, seed, ttl } => {
            let ttl = ttl.unwrap_or(config.environments.default_ttl_secs);
            let record = registry.create(&name, seed, ttl)?;
            print_json(&record)?;
        }
        EnvCommands::Get { name } => {
            let record = registry.get(&name)?;
            print_json(&record)?;
        }
        EnvCommands::List => {
            let records = registry.list()?;
            if records.is_empty() {
                println!("No live environments");
            }
            for record in records {
                println!(
                    "{:<24} {:<10} expires {}",
                    record.name,
                    record.seed_mode,
                    record.expires_at().format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        EnvCommands::Delete { name } => match registry.delete(&name)? {
            DeleteOutcome::Deleted => println!("Deleted {name}"),
            DeleteOutcome::AlreadyGone => println!("{name} was already gone"),
        },
        EnvCommands::Cleanup => {
            let report = registry.startup_cleanup()?;
            print_json(&report)?;
        }
    }
    Ok(())
}

pub fn run_config(config: &Config, path: Option<PathBuf>, init: bool) -> Result<()> {
    if init {
        let path = path.unwrap_or_else(Config::default_path);
        config.save(&path)?;
        info!(path = %path.display(), "configuration written");
        println!("Wrote {}", path.display());
    } else {
        print!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

#[cfg(feature = "server")]
pub async fn run_serve(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    no_schedule: bool,
) -> Result<()> {
    use opsmirror::env::TtlWatcher;
    use opsmirror::server::{serve, shutdown_signal, AppState};
    use tokio::sync::watch;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr: std::net::SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let services = Services::open(&config)?;
    let orchestrator = Arc::new(build_orchestrator(&config, services.clock.clone())?);

    let registry = services.registry.clone();
    let cleanup = tokio::task::spawn_blocking(move || registry.startup_cleanup()).await??;
    info!(
        expired = cleanup.expired.len(),
        orphans = cleanup.orphans.len(),
        dangling = cleanup.dangling.len(),
        "startup reconciliation done"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = TtlWatcher::new(config.sweep_interval(), services.clock.clone())
        .register(services.registry.clone())
        .register(orchestrator.progress().clone())
        .spawn(shutdown_rx.clone());

    let scheduled = if config.sync.enabled && !no_schedule {
        let orchestrator = orchestrator.clone();
        let store = services.production.clone();
        let interval = config.sync_interval();
        let sync_on_start = config.sync.sync_on_start;
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if !sync_on_start {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = rx.changed() => return,
                }
            }
            orchestrator.run_periodic(store, interval, rx).await;
        }))
    } else {
        None
    };

    let state = Arc::new(AppState::new(
        services.resolver.clone(),
        orchestrator,
        config.environments.default_ttl_secs,
    ));
    serve(addr, state, async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    if let Err(e) = watcher.await {
        warn!(error = %e, "ttl watcher ended abnormally");
    }
    if let Some(handle) = scheduled {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduled sync ended abnormally");
        }
    }
    Ok(())
}
