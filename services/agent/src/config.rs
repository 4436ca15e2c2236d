//! Configuration for the agent.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::scheduler::SchedulerConfig;

/// Which coordination store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Etcd,
    /// In-process store; only meaningful for a single-node dev run.
    Memory,
}

/// Which container runtime to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Mock,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address this node advertises in slot records and announcements.
    pub node_addr: String,

    pub store: StoreKind,

    /// etcd endpoint.
    pub etcd_url: String,

    pub runtime: RuntimeKind,

    /// Docker engine socket path.
    pub docker_socket: String,

    /// DNS suffix for service discovery.
    pub discovery_domain: String,

    /// Delay per load-order step, in seconds.
    pub stagger_secs: u64,

    /// Container stop grace period, in seconds.
    pub stop_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let node_addr = var("FLOTILLA_NODE_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());

        let store = match var("FLOTILLA_STORE").as_deref() {
            None | Some("etcd") => StoreKind::Etcd,
            Some("memory") => StoreKind::Memory,
            Some(other) => bail!("unknown FLOTILLA_STORE: {other}"),
        };
        let etcd_url =
            var("FLOTILLA_ETCD_URL").unwrap_or_else(|| "http://127.0.0.1:4001".to_string());

        let runtime = match var("FLOTILLA_RUNTIME").as_deref() {
            None | Some("docker") => RuntimeKind::Docker,
            Some("mock") => RuntimeKind::Mock,
            Some(other) => bail!("unknown FLOTILLA_RUNTIME: {other}"),
        };
        let docker_host =
            var("DOCKER_HOST").unwrap_or_else(|| "unix:///var/run/docker.sock".to_string());
        let Some(docker_socket) = docker_host.strip_prefix("unix://") else {
            bail!("DOCKER_HOST must be a unix:// socket, got {docker_host}");
        };

        let discovery_domain =
            var("FLOTILLA_DISCOVERY_DOMAIN").unwrap_or_else(|| "skydns.local".to_string());

        let stagger_secs = var("FLOTILLA_STAGGER_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let stop_timeout_secs = var("FLOTILLA_STOP_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let log_level = var("FLOTILLA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_addr,
            store,
            etcd_url,
            runtime,
            docker_socket: docker_socket.to_string(),
            discovery_domain,
            stagger_secs,
            stop_timeout_secs,
            log_level,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            stagger_unit: Duration::from_secs(self.stagger_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            discovery_domain: self.discovery_domain.clone(),
        }
    }
}
