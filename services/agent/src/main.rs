//! Flotilla Agent
//!
//! Runs on every node. Watches the coordination store for application
//! manifests, claims replica slots, runs containers through the local engine
//! and announces them for discovery.
//!
//! ## Architecture
//!
//! - **Scheduler**: reacts to manifest changes under `/apps`
//! - **Register**: reacts to container start/die events from the runtime
//! - **Store**: etcd in production, in-memory for single-node dev
//! - **Runtime**: Docker in production, mock in dev

use std::sync::Arc;

use anyhow::{Context, Result};
use flotilla_coord::{EtcdClient, KvStore, MemoryStore, Watcher};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla_agent::config::{Config, RuntimeKind, StoreKind};
use flotilla_agent::{ContainerRuntime, Discovery, DockerClient, MockRuntime, Register, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_addr = %config.node_addr,
        store = ?config.store,
        etcd_url = %config.etcd_url,
        runtime = ?config.runtime,
        docker_socket = %config.docker_socket,
        discovery_domain = %config.discovery_domain,
        "Starting flotilla agent"
    );

    let store: Arc<dyn KvStore> = match config.store {
        StoreKind::Etcd => Arc::new(
            EtcdClient::new(config.etcd_url.as_str()).context("failed to build etcd client")?,
        ),
        StoreKind::Memory => {
            warn!("Using in-memory store; placement is not shared with other nodes");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Docker => {
            let docker = DockerClient::new(&config.docker_socket);
            if !docker.socket_exists() {
                warn!(socket = %config.docker_socket, "Docker socket not found");
            }
            Arc::new(docker)
        }
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        config.node_addr.clone(),
        Arc::clone(&store),
        Arc::clone(&runtime),
        Watcher::new(Arc::clone(&store), shutdown_rx.clone()),
        config.scheduler_config(),
    ));
    let register = Arc::new(Register::new(
        config.node_addr.clone(),
        Arc::clone(&store),
        Arc::clone(&runtime),
        Discovery::new(&config.discovery_domain),
        shutdown_rx,
    ));

    let mut scheduler_handle = Arc::clone(&scheduler).start();
    let mut register_handle = Arc::clone(&register).start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        result = &mut scheduler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Scheduling task panicked");
            }
        }
        result = &mut register_handle => {
            match result {
                Ok(()) => warn!("Registration loop exited"),
                Err(e) => error!(error = %e, "Registration task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for loops to shut down...");
    for handle in [scheduler_handle, register_handle] {
        if handle.is_finished() {
            continue;
        }
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("Loop did not stop in time");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}
