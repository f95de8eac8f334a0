use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::lib::{
    api::types::TaskServer,
    config::{ControllerConfig, SubstrateKind},
    ledger::capacity::{HostCapacity, resolve_capacity},
    manager::types::Manager,
    substrate::{docker::DockerSubstrate, memory::MemorySubstrate, types::Substrate},
};

mod lib {
    pub mod access;
    pub mod api;
    pub mod config;
    pub mod error;
    pub mod exposure;
    pub mod launcher;
    pub mod ledger;
    pub mod manager;
    pub mod substrate;
    pub mod tasks;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpu_pool=info")))
        .init();

    let config = ControllerConfig::parse();
    config.validate()?;

    let host = HostCapacity::detect();
    info!(
        hostname = %host.hostname,
        system = %host.system_name,
        cpus = host.total_cpus,
        gpus = host.total_gpus,
        memory_mb = host.total_memory_mb,
        "host detected"
    );

    let substrate: Arc<dyn Substrate> = match config.substrate {
        SubstrateKind::Docker => Arc::new(DockerSubstrate::connect(config.container_port)?),
        SubstrateKind::Memory => Arc::new(MemorySubstrate::new(host.resources())),
    };
    let discovered = match substrate.capacity().await {
        Ok(capacity) => capacity,
        Err(e) => {
            warn!(error = %e, substrate = substrate.name(), "capacity query failed, using host totals");
            host.resources()
        }
    };
    let capacity = resolve_capacity(discovered, config.cpus, config.gpus);
    if capacity.cpus == 0 {
        anyhow::bail!("resource pool has no CPUs; pass --cpus to set one");
    }

    let manager = Arc::new(Manager::new(&config, substrate, capacity));
    let server = TaskServer::new(manager, config.bind, config.cors_origins.clone());
    server.start_server().await
}
