use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use registrar::config::RegistrationConfig;
use registrar::registry::Registration;
use registrar::store::{Connect, MemoryStore};
use registrar::utils::parse_duration;

#[derive(Parser)]
#[command(name = "registrar")]
#[command(about = "Register a service instance under a renewed store lease", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register, keep the lease alive, and deregister on Ctrl-C
    Run(RegistrationArgs),
    /// Print the registration key the config resolves to
    Key(RegistrationArgs),
    /// Show version information
    Version,
}

#[derive(Args)]
struct RegistrationArgs {
    /// Config file (defaults to ~/.registrar/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store endpoints, comma separated (http://host:2379 or memory://name)
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Registry key prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Service name
    #[arg(short, long)]
    service: Option<String>,

    /// Node id (defaults to a random UUID)
    #[arg(long)]
    node_id: Option<String>,

    /// Advertised address (host:port)
    #[arg(short, long)]
    address: Option<String>,

    /// Lease TTL, e.g. 9s or 1m
    #[arg(long)]
    ttl: Option<String>,

    /// Metadata label, repeatable (key=value)
    #[arg(short, long = "meta")]
    metadata: Vec<String>,

    /// Reaction to a lost lease: keep or regrant
    #[arg(long)]
    lease_loss: Option<String>,
}

impl RegistrationArgs {
    /// Load the layered config and apply CLI flags on top.
    fn resolve(self) -> Result<RegistrationConfig> {
        let mut config = RegistrationConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if !self.endpoints.is_empty() {
            config.store.endpoints = self.endpoints;
        }
        if let Some(prefix) = self.prefix {
            config.registry_prefix = prefix;
        }
        if let Some(service) = self.service {
            config.service_name = service;
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(address) = self.address {
            config.node_data.address = address;
        }
        if let Some(ttl) = self.ttl {
            config.ttl = parse_duration(&ttl)?;
        }
        for pair in self.metadata {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("Invalid metadata '{}', expected key=value", pair);
            };
            config
                .node_data
                .metadata
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        if let Some(policy) = self.lease_loss {
            config.lease_loss = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Some(Commands::Version) | None => {
            println!("registrar {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Key(args)) => {
            let config = args.resolve()?;
            println!("{}", config.key());
        }
        Some(Commands::Run(args)) => {
            let config = args.resolve()?;
            if config.store.is_memory() {
                run::<MemoryStore>(config).await?;
            } else {
                run_etcd(config).await?;
            }
        }
    }

    Ok(())
}

#[cfg(feature = "etcd")]
async fn run_etcd(config: RegistrationConfig) -> Result<()> {
    run::<registrar::store::EtcdStore>(config).await
}

#[cfg(not(feature = "etcd"))]
async fn run_etcd(config: RegistrationConfig) -> Result<()> {
    bail!(
        "Endpoints {:?} need the etcd backend; rebuild with --features etcd or use memory://",
        config.store.endpoints
    )
}

async fn run<S: Connect + 'static>(config: RegistrationConfig) -> Result<()> {
    let registration = Arc::new(
        Registration::<S>::connect(config)
            .await
            .context("Failed to create registration")?,
    );
    println!("Registering {} (Ctrl+C to deregister)", registration.key());

    let heartbeat = Arc::clone(&registration).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    registration.deregister()?;
    heartbeat.await.context("Heartbeat task panicked")??;

    let stats = registration.stats();
    info!(
        renewals = stats.renewals,
        renewal_failures = stats.renewal_failures,
        grants = stats.grants,
        "Deregistered"
    );
    Ok(())
}
