//! Anvil Conductor - Bare-Metal Lifecycle Orchestrator

use anvil_conductor::actors::spawn_node_actor_manager;
use anvil_conductor::config::ConductorConfig;
use anvil_conductor::drivers::FakeHardware;
use anvil_conductor::observability::{events, metrics};
use anvil_conductor::orchestrator::NodeOrchestrator;
use anvil_conductor::registry::DriverRegistry;
use anvil_conductor::store::{EtcdStore, MemoryStore, NodeStore};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "anvil-conductor", about = "Bare-metal lifecycle conductor")]
struct Args {
    /// Storage backend: "etcd" or "memory" (memory is single-process only).
    #[arg(long, default_value = "etcd")]
    store: String,

    /// Stable conductor identity.
    #[arg(long, env = "CONDUCTOR_ID")]
    conductor_id: Option<String>,

    /// Conductor group whose nodes this process manages.
    #[arg(long, env = "CONDUCTOR_GROUP")]
    conductor_group: Option<String>,

    /// Comma-separated etcd endpoints.
    #[arg(long, env = "ETCD_ENDPOINTS")]
    etcd_endpoints: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = ConductorConfig::from_env();
    if let Some(id) = args.conductor_id {
        config.conductor_id = id;
    }
    if let Some(group) = args.conductor_group {
        config.conductor_group = group;
    }
    if let Some(endpoints) = args.etcd_endpoints {
        config.etcd_endpoints = endpoints.split(',').map(String::from).collect();
    }
    let config = Arc::new(config);

    info!("Starting Anvil Conductor...");
    info!("Conductor ID: {}", config.conductor_id);
    info!("Conductor group: {}", config.conductor_group);

    let _metrics = metrics::init_metrics()?;

    let store: Arc<dyn NodeStore> = match args.store.as_str() {
        "memory" => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new(config.dead_conductor_timeout))
        }
        "etcd" => {
            info!("Connecting to etcd at {:?}", config.etcd_endpoints);
            Arc::new(EtcdStore::connect(&config).await?)
        }
        other => {
            return Err(format!("unknown store backend: {other}").into());
        }
    };

    store.register_conductor(&config.conductor_id).await?;
    events::conductor_registered(&config.conductor_id, &config.conductor_group);

    let mut registry = DriverRegistry::new(config.enabled_interfaces.clone());
    let fake = FakeHardware::new();
    fake.install(&mut registry);

    let orchestrator = Arc::new(NodeOrchestrator::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::clone(&config),
    ));

    let manager = spawn_node_actor_manager(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&orchestrator),
    );

    info!("Conductor running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    manager.abort();

    Ok(())
}
