//! WolfHA - High-Availability Clustering for MariaDB/MySQL
//!
//! Command line entry point: runs a cluster node and inspects or repairs its
//! persisted state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::cluster::DatabaseCluster;
use wolfha::config::{LoggingConfig, WolfHaConfig};
use wolfha::executor::{MySqlBackend, SqlExceptionFactory};
use wolfha::lock::{DistributedLockManager, LocalLockManager, LockManager, RemoteLockRegistry};
use wolfha::network::{LockServer, TcpCommandChannel};
use wolfha::state;

/// Interval between member health checks
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// WolfHA - High-Availability Clustering for MariaDB/MySQL
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Start,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,

        /// Cluster ID
        #[arg(long, default_value = "app")]
        cluster_id: String,
    },

    /// Print persisted membership and open invocations as JSON
    State,

    /// Resolve invocations left open by a crash, without serving traffic
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = WolfHaConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    init_logging(&logging);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Validate => run_validate(&cli.config),
        Commands::Init { output, cluster_id } => run_init(&output, &cluster_id),
        Commands::State => run_state(&cli.config).await,
        Commands::Recover => run_recover(&cli.config).await,
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load(config_path: &Path) -> anyhow::Result<WolfHaConfig> {
    let config = WolfHaConfig::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    if config.state.backend == "sqlite" {
        std::fs::create_dir_all(&config.state.data_dir).with_context(|| {
            format!("Failed to create data directory {:?}", config.state.data_dir)
        })?;
    }
    Ok(config)
}

/// Start the cluster node
async fn run_start(config_path: &Path) -> anyhow::Result<()> {
    tracing::info!("Starting WolfHA node...");
    let config = load(config_path)?;
    tracing::info!(
        "Loaded configuration for cluster {} ({} members)",
        config.cluster.id,
        config.members.len()
    );

    if !config.cluster.lock_peers.is_empty() && config.all_members_local() {
        tracing::info!("All members are local to this node; lock peers are not consulted");
    }

    let local_locks = Arc::new(LocalLockManager::new());
    let mut lock_server = None;
    let locks: Arc<dyn LockManager> = match &config.cluster.lock_bind_address {
        Some(bind_address) if config.distributed_locking() => {
            let registry = Arc::new(RemoteLockRegistry::new(Arc::clone(&local_locks)));
            let server = Arc::new(
                LockServer::bind(bind_address, registry)
                    .await
                    .with_context(|| format!("Failed to bind lock server to {}", bind_address))?,
            );
            let running = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = running.run().await {
                    tracing::error!("Lock server error: {}", e);
                }
            });
            lock_server = Some(server);

            let channel = Arc::new(TcpCommandChannel::new(
                Duration::from_secs(5),
                Duration::from_secs(5),
            ));
            Arc::new(DistributedLockManager::new(
                config.cluster.node_id.clone(),
                local_locks,
                channel,
                config.cluster.lock_peers.clone(),
                config.lock_timeout(),
            ))
        }
        _ => local_locks,
    };

    let cluster = DatabaseCluster::from_config(&config)?
        .lock_manager(locks)
        .exception_factory(Arc::new(SqlExceptionFactory))
        .build()?;

    let report = cluster.start().await.context("Cluster startup failed")?;
    if !report.is_empty() {
        tracing::warn!(
            "Recovered {} interrupted invocations, deactivated {:?}",
            report.resolved.len(),
            report.deactivated
        );
    }

    let backend = MySqlBackend::new(&config.pool);
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                check_members(&cluster, &backend).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Some(server) = lock_server {
        server.stop();
    }
    backend.close().await;
    tracing::info!("WolfHA node stopped");
    Ok(())
}

/// Deactivate members that stop answering, never the last one
async fn check_members(cluster: &DatabaseCluster, backend: &MySqlBackend) -> anyhow::Result<()> {
    for member in cluster.balancer().snapshot() {
        let reason = match backend.health_check(&member).await {
            Ok(true) => continue,
            Ok(false) => "health check returned unexpected result".to_string(),
            Err(e) => format!("health check failed: {}", e),
        };
        if cluster.balancer().snapshot().len() <= 1 {
            tracing::error!("Last active member {} is unhealthy: {}", member, reason);
            continue;
        }
        cluster.deactivate(&member, &reason).await?;
    }
    Ok(())
}

/// Print persisted state
async fn run_state(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let store = state::open(&config.state, &config.cluster.id)?;

    let mut members = Vec::new();
    for member in &config.members {
        let record = store.member_record(&member.id).await?;
        members.push(serde_json::json!({
            "id": member.id,
            "weight": member.weight,
            "record": record,
        }));
    }
    let unresolved = store.unresolved_invocations().await?;

    let output = serde_json::json!({
        "cluster": config.cluster.id,
        "backend": config.state.backend,
        "members": members,
        "unresolved": unresolved,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Run recovery against the persisted state
async fn run_recover(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let cluster = DatabaseCluster::from_config(&config)?.build()?;
    let report = cluster.start().await.context("Recovery failed")?;

    if report.is_empty() {
        println!("Nothing to recover");
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Create a configuration file
fn run_init(output: &Path, cluster_id: &str) -> anyhow::Result<()> {
    std::fs::write(output, WolfHaConfig::template(cluster_id))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your members and cluster settings.");
    println!("Then start with: wolfha start --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match WolfHaConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Cluster ID: {}", config.cluster.id);
            println!("  Balancer: {}", config.cluster.balancer);
            println!("  Strategy: {}", config.cluster.strategy);
            println!("  Durability: {}", config.cluster.durability);
            println!("  State: {} ({})", config.state.backend, config.state.data_dir.display());
            for member in &config.members {
                println!("  Member {}: weight {}{}", member.id, member.weight,
                    if member.local { ", local" } else { "" });
            }
            println!("  Lock peers: {}", config.cluster.lock_peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
