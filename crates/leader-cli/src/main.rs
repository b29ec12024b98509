//! Leader election candidate
//!
//! Runs one candidate against the configured lease backend and prints every
//! leadership event as a JSON line until interrupted.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use leader_election::{
    CancellationToken, ElectionConfig, LeaderCallbacks, LeaderElector, StoreBackendConfig,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Sled,
    Kubernetes,
}

#[derive(Parser, Debug)]
#[clap(
    name = "leader-elect",
    version,
    about = "Lease-based leader election candidate"
)]
struct Args {
    /// Config file path (TOML); flags below override its values
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Name of the contested lease
    #[clap(long)]
    name: Option<String>,

    /// Namespace of the lease
    #[clap(short, long)]
    namespace: Option<String>,

    /// Candidate identity (generated from the host name when omitted)
    #[clap(short, long)]
    identity: Option<String>,

    /// Lease backend
    #[clap(long, value_enum)]
    backend: Option<Backend>,

    /// Database directory for the sled backend
    #[clap(long, default_value = "./leases")]
    sled_path: PathBuf,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

impl Args {
    fn election_config(&self) -> Result<ElectionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                ElectionConfig::from_file(path)?
            }
            None => {
                info!("Using default configuration");
                ElectionConfig::default()
            }
        };

        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity = identity.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = match backend {
                Backend::Memory => StoreBackendConfig::Memory,
                Backend::Sled => StoreBackendConfig::Sled {
                    path: self.sled_path.clone(),
                },
                Backend::Kubernetes => StoreBackendConfig::Kubernetes,
            };
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "leader_election={},leader_elect={}",
                    log_level, log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = args.election_config()?;
    if matches!(config.backend, StoreBackendConfig::Memory) {
        warn!("Memory backend only arbitrates candidates inside this process");
    }

    let callbacks = LeaderCallbacks::new()
        .on_started_leading(|| info!("Acting as leader"))
        .on_stopped_leading(|| info!("No longer acting as leader"));
    let elector = LeaderElector::from_config(config, callbacks).await?;
    info!(
        "Candidate {} contending for {}/{}",
        elector.identity(),
        elector.namespace(),
        elector.name()
    );

    // Print leadership events as JSON lines
    let mut events = elector.handle().events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Handle shutdown gracefully
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
            cancel.cancel();
        });
    }

    let result = elector.run(cancel).await;
    drop(elector);
    let _ = printer.await;

    if let Err(e) = result {
        error!("Election error: {}", e);
        std::process::exit(1);
    }

    info!("Leader election candidate stopped");
    Ok(())
}
