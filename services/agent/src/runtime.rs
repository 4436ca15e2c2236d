//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the local container engine:
//! - Creating, starting, stopping, and removing containers
//! - Pulling images
//! - Streaming container lifecycle events
//!
//! [`DockerClient`](crate::docker::DockerClient) implements it against the
//! Docker Engine API; [`MockRuntime`] is an in-memory engine for tests and
//! development.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::image::ImageRef;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container or image: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("image pull failed for {image}: {message}")]
    Pull { image: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("HTTP request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names without the leading `/`.
    pub names: Vec<String>,
    pub image: String,
    pub running: bool,
}

/// A published port on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Inspection result for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    pub image: String,
    /// Environment as `KEY=value` strings.
    pub env: Vec<String>,
    pub running: bool,
    /// Published ports keyed by `<port>/<proto>`.
    pub ports: BTreeMap<String, Vec<PortBinding>>,
}

impl ContainerDetails {
    /// Value of an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|e| {
            let (k, v) = e.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// First host port bound to a TCP container port.
    pub fn host_port(&self, container_port: u16) -> Option<&str> {
        self.ports
            .get(&format!("{container_port}/tcp"))
            .and_then(|bindings| bindings.first())
            .map(|b| b.host_port.as_str())
    }
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub exposed_ports: Vec<u16>,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    pub publish_all_ports: bool,
    /// Links as `<container>:<alias>`.
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    pub remove_volumes: bool,
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    /// Engine status string: `start`, `die`, `stop`, `destroy`, ...
    pub status: String,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Inspect a container by id or name.
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails>;

    /// Create a container; returns its id.
    async fn create_container(&self, opts: &CreateOptions) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Stop, killing after `grace` if the process has not exited.
    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> RuntimeResult<i64>;

    async fn remove_container(&self, id: &str, opts: RemoveOptions) -> RuntimeResult<()>;

    async fn pull_image(&self, image: &ImageRef) -> RuntimeResult<()>;

    /// Subscribe to container lifecycle events.
    async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>>;
}

// =============================================================================
// Mock Runtime
// =============================================================================

/// First host port the mock hands out for published ports.
const MOCK_EPHEMERAL_PORT_START: u16 = 32768;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    image: String,
    env: Vec<String>,
    exposed_ports: Vec<u16>,
    publish_all_ports: bool,
    links: Vec<String>,
    command: Vec<String>,
    running: bool,
    ports: BTreeMap<String, Vec<PortBinding>>,
}

impl MockContainer {
    fn details(&self) -> ContainerDetails {
        ContainerDetails {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            env: self.env.clone(),
            running: self.running,
            ports: self.ports.clone(),
        }
    }
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    pulled: Vec<ImageRef>,
    failing_repositories: HashSet<String>,
    subscribers: Vec<mpsc::Sender<ContainerEvent>>,
    next_host_port: u16,
}

impl MockState {
    fn find(&self, id_or_name: &str) -> Option<&MockContainer> {
        let needle = id_or_name.trim_start_matches('/');
        self.containers
            .values()
            .find(|c| c.id == needle || c.name == needle)
    }

    fn find_id(&self, id_or_name: &str) -> RuntimeResult<String> {
        self.find(id_or_name)
            .map(|c| c.id.clone())
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))
    }

    fn emit(&mut self, id: &str, status: &str) {
        let event = ContainerEvent {
            id: id.to_string(),
            status: status.to_string(),
        };
        self.subscribers
            .retain(|tx| !matches!(tx.try_send(event.clone()), Err(mpsc::error::TrySendError::Closed(_))));
    }
}

/// In-memory container engine for testing and development.
pub struct MockRuntime {
    state: Mutex<MockState>,
    id_counter: AtomicU64,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_host_port: MOCK_EPHEMERAL_PORT_START,
                ..MockState::default()
            }),
            id_counter: AtomicU64::new(1),
        }
    }

    /// Make every pull of `repository` fail.
    pub fn fail_pulls_for(&self, repository: &str) {
        self.state().failing_repositories.insert(repository.to_string());
    }

    /// Images pulled so far, in order.
    pub fn pulled_images(&self) -> Vec<ImageRef> {
        self.state().pulled.clone()
    }

    /// Names of all containers, running or not.
    pub fn container_names(&self) -> Vec<String> {
        self.state().containers.values().map(|c| c.name.clone()).collect()
    }

    /// Names of running containers.
    pub fn running_names(&self) -> Vec<String> {
        self.state()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Links a container was created with.
    pub fn links_of(&self, id_or_name: &str) -> Option<Vec<String>> {
        self.state().find(id_or_name).map(|c| c.links.clone())
    }

    /// Command a container was created with.
    pub fn command_of(&self, id_or_name: &str) -> Option<Vec<String>> {
        self.state().find(id_or_name).map(|c| c.command.clone())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{n:064x}")
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| all || c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.image.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        self.state()
            .find(id)
            .map(MockContainer::details)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn create_container(&self, opts: &CreateOptions) -> RuntimeResult<String> {
        let id = self.next_id();
        let mut state = self.state();
        if state.find(&opts.name).is_some() {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                opts.name
            )));
        }
        info!(name = %opts.name, image = %opts.image, "[MOCK] Creating container");
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: opts.name.clone(),
                image: opts.image.clone(),
                env: opts.env.clone(),
                exposed_ports: opts.exposed_ports.clone(),
                publish_all_ports: opts.publish_all_ports,
                links: opts.links.clone(),
                command: opts.command.clone(),
                running: false,
                ports: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let id = state.find_id(id)?;
        let mut next_port = state.next_host_port;
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        if container.running {
            return Ok(());
        }
        container.running = true;
        if container.publish_all_ports {
            for port in &container.exposed_ports {
                container.ports.insert(
                    format!("{port}/tcp"),
                    vec![PortBinding {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: next_port.to_string(),
                    }],
                );
                next_port += 1;
            }
        }
        info!(name = %container.name, "[MOCK] Container started");
        state.next_host_port = next_port;
        state.emit(&id, "start");
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let mut state = self.state();
        let id = state.find_id(id)?;
        let was_running = match state.containers.get_mut(&id) {
            Some(c) => std::mem::replace(&mut c.running, false),
            None => return Err(RuntimeError::NotFound(id)),
        };
        debug!(%id, grace_secs = grace.as_secs(), "[MOCK] Stopping container");
        if was_running {
            state.emit(&id, "die");
            state.emit(&id, "stop");
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        self.state().find_id(id).map(|_| 0)
    }

    async fn remove_container(&self, id: &str, opts: RemoveOptions) -> RuntimeResult<()> {
        let mut state = self.state();
        let id = state.find_id(id)?;
        let running = state.containers.get(&id).is_some_and(|c| c.running);
        if running && !opts.force {
            return Err(RuntimeError::Conflict(format!(
                "cannot remove running container {id}"
            )));
        }
        if running {
            state.emit(&id, "die");
        }
        state.containers.remove(&id);
        debug!(%id, volumes = opts.remove_volumes, "[MOCK] Container removed");
        state.emit(&id, "destroy");
        Ok(())
    }

    async fn pull_image(&self, image: &ImageRef) -> RuntimeResult<()> {
        let mut state = self.state();
        if state.failing_repositories.contains(&image.repository) {
            return Err(RuntimeError::Pull {
                image: image.to_string(),
                message: "Mock runtime configured to fail".to_string(),
            });
        }
        info!(%image, "[MOCK] Pulled image");
        state.pulled.push(image.clone());
        Ok(())
    }

    async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.state().subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(name: &str) -> CreateOptions {
        CreateOptions {
            name: name.to_string(),
            image: "nginx:1.18".to_string(),
            env: vec!["FLOTILLA_APP_NAME=shop".to_string()],
            exposed_ports: vec![80],
            publish_all_ports: true,
            ..CreateOptions::default()
        }
    }

    #[tokio::test]
    async fn test_mock_lifecycle_emits_events() {
        let runtime = MockRuntime::new();
        let mut events = runtime.subscribe_events().await.unwrap();

        let id = runtime.create_container(&opts("shop---api")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let details = runtime.inspect_container("shop---api").await.unwrap();
        assert!(details.running);
        assert_eq!(details.host_port(80), Some("32768"));
        assert_eq!(details.env_var("FLOTILLA_APP_NAME"), Some("shop"));

        runtime.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        runtime
            .remove_container(&id, RemoveOptions::default())
            .await
            .unwrap();

        let statuses: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec!["start", "die", "stop", "destroy"]);
    }

    #[tokio::test]
    async fn test_mock_name_conflict_and_not_found() {
        let runtime = MockRuntime::new();
        runtime.create_container(&opts("a")).await.unwrap();
        assert!(matches!(
            runtime.create_container(&opts("a")).await,
            Err(RuntimeError::Conflict(_))
        ));
        assert!(runtime.inspect_container("missing").await.unwrap_err().is_not_found());
        assert!(runtime
            .remove_container("missing", RemoveOptions::default())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_mock_remove_running_requires_force() {
        let runtime = MockRuntime::new();
        let id = runtime.create_container(&opts("a")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        assert!(runtime.remove_container(&id, RemoveOptions::default()).await.is_err());
        runtime
            .remove_container(&id, RemoveOptions { force: true, remove_volumes: false })
            .await
            .unwrap();
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_mock_pull_failure() {
        let runtime = MockRuntime::new();
        runtime.fail_pulls_for("broken");
        let image = ImageRef::parse("broken:1").unwrap();
        assert!(runtime.pull_image(&image).await.is_err());
        assert!(runtime.pulled_images().is_empty());
    }

    #[test]
    fn test_env_var_lookup() {
        let details = ContainerDetails {
            id: "x".into(),
            name: "n".into(),
            image: "i".into(),
            env: vec!["A=1".into(), "B=x=y".into(), "NOVALUE".into()],
            running: true,
            ports: BTreeMap::new(),
        };
        assert_eq!(details.env_var("A"), Some("1"));
        assert_eq!(details.env_var("B"), Some("x=y"));
        assert_eq!(details.env_var("NOVALUE"), None);
        assert_eq!(details.host_port(80), None);
    }
}
