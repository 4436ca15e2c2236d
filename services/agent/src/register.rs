//! Service registration bridge.
//!
//! Follows the runtime's event stream, independently of the scheduler:
//! - `start`: record the container in this node's load tree and publish its
//!   service announcements
//! - `die`: undo both
//!
//! Containers whose name starts with [`PRIVATE_PREFIX`] are infrastructure
//! (the ambassador, for instance) and are never registered.
//!
//! Failures are logged and skipped; the next lifecycle transition of the
//! same container brings the store back in line.

use std::collections::HashMap;
use std::sync::Arc;

use flotilla_coord::{shutdown_requested, BackoffPolicy, KvStore, Precondition};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::load_key;
use crate::runtime::{ContainerEvent, ContainerRuntime};
use crate::service::{services_from, Discovery, Service};

/// Name prefix of containers that are never registered.
pub const PRIVATE_PREFIX: &str = "__";

/// Publishes running containers for discovery and load ranking.
pub struct Register {
    node_addr: String,
    store: Arc<dyn KvStore>,
    runtime: Arc<dyn ContainerRuntime>,
    discovery: Discovery,
    shutdown: watch::Receiver<bool>,
    backoff: BackoffPolicy,

    /// Services announced per container id, for retraction after the
    /// container is gone.
    announced: Mutex<HashMap<String, Vec<Service>>>,
}

impl Register {
    pub fn new(
        node_addr: impl Into<String>,
        store: Arc<dyn KvStore>,
        runtime: Arc<dyn ContainerRuntime>,
        discovery: Discovery,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_addr: node_addr.into(),
            store,
            runtime,
            discovery,
            shutdown,
            backoff: BackoffPolicy::default(),
            announced: Mutex::new(HashMap::new()),
        }
    }

    /// Override the resubscribe backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn the registration loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Register what already runs, then follow runtime events until shutdown.
    ///
    /// A failed subscription or an ended event stream is retried with
    /// backoff, and every fresh subscription re-syncs running containers so
    /// that transitions missed in between are picked up.
    pub async fn run(&self) {
        info!(node = %self.node_addr, "Starting registration loop");
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        while !*shutdown.borrow() {
            match self.runtime.subscribe_events().await {
                Ok(mut events) => {
                    self.sync_running().await;
                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Some(event) => {
                                    attempt = 0;
                                    self.handle_event(&event).await;
                                }
                                None => break,
                            },
                            _ = shutdown_requested(&mut shutdown) => break,
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(node = %self.node_addr, "Runtime event stream ended, resubscribing");
                }
                Err(e) => error!(error = %e, attempt, "Failed to subscribe to runtime events"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(node = %self.node_addr, "Registration loop stopped");
    }

    /// Register every running container.
    pub async fn sync_running(&self) {
        match self.runtime.list_containers(false).await {
            Ok(containers) => {
                for container in containers.iter().filter(|c| c.running) {
                    self.add(&container.id).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to list running containers"),
        }
    }

    pub async fn handle_event(&self, event: &ContainerEvent) {
        match event.status.as_str() {
            "start" => self.add(&event.id).await,
            "die" => self.remove(&event.id).await,
            other => debug!(id = %event.id, status = other, "Ignoring runtime event"),
        }
    }

    /// Register a started container.
    pub async fn add(&self, id: &str) {
        let details = match self.runtime.inspect_container(id).await {
            Ok(details) => details,
            Err(e) => {
                warn!(%id, error = %e, "Failed to inspect started container");
                return;
            }
        };
        if details.name.starts_with(PRIVATE_PREFIX) {
            debug!(name = %details.name, "Skipping private container");
            return;
        }

        let key = load_key(&self.node_addr, &details.id);
        if let Err(e) = self.store.set(&key, "").await {
            warn!(%key, error = %e, "Failed to record container load");
        }

        let services = services_from(&details);
        for service in &services {
            self.announce(service).await;
        }
        info!(name = %details.name, services = services.len(), "Registered container");
        self.announced.lock().await.insert(details.id, services);
    }

    /// Deregister a stopped container.
    pub async fn remove(&self, id: &str) {
        let cached = self.announced.lock().await.remove(id);
        let (container_id, services) = match self.runtime.inspect_container(id).await {
            Ok(details) => {
                if details.name.starts_with(PRIVATE_PREFIX) {
                    debug!(name = %details.name, "Skipping private container");
                    return;
                }
                let services = services_from(&details);
                (details.id, services)
            }
            Err(e) => match cached {
                Some(services) => (id.to_string(), services),
                None => {
                    debug!(%id, error = %e, "Container gone and never registered");
                    (id.to_string(), Vec::new())
                }
            },
        };

        let key = load_key(&self.node_addr, &container_id);
        match self.store.delete(&key, false).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%key, error = %e, "Failed to remove container load"),
        }

        for service in &services {
            self.retract(service).await;
        }
        info!(%container_id, services = services.len(), "Deregistered container");
    }

    fn announcement_body(&self, service: &Service) -> Option<String> {
        match serde_json::to_string(&service.announcement(&self.node_addr)) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(service = %service.name, error = %e, "Failed to encode announcement");
                None
            }
        }
    }

    fn announcement_keys(&self, service: &Service) -> Vec<String> {
        let mut keys = vec![self.discovery.service_key(service)];
        if service.is_web() {
            keys.push(self.discovery.web_key(service));
        }
        keys
    }

    async fn announce(&self, service: &Service) {
        let Some(body) = self.announcement_body(service) else {
            return;
        };
        for key in self.announcement_keys(service) {
            match self.store.set(&key, &body).await {
                Ok(_) => debug!(%key, %body, "Announced service"),
                Err(e) => warn!(%key, error = %e, "Failed to announce service"),
            }
        }
    }

    /// Delete an announcement only if it still holds what this node wrote.
    async fn retract(&self, service: &Service) {
        let Some(body) = self.announcement_body(service) else {
            return;
        };
        for key in self.announcement_keys(service) {
            match self
                .store
                .compare_and_delete(&key, Precondition::PrevValue(body.clone()))
                .await
            {
                Ok(_) => debug!(%key, "Retracted service"),
                Err(e) if e.is_not_found() || e.is_test_failed() => {
                    debug!(%key, error = %e, "Announcement already gone or replaced")
                }
                Err(e) => warn!(%key, error = %e, "Failed to retract service"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use flotilla_coord::MemoryStore;
    use tokio::sync::mpsc;

    use super::*;
    use crate::image::ImageRef;
    use crate::runtime::{
        ContainerDetails, ContainerSummary, CreateOptions, MockRuntime, RemoveOptions,
        RuntimeError, RuntimeResult,
    };
    use crate::service::Announcement;

    /// Engine whose first subscription fails and whose later event streams
    /// end immediately, like a daemon that keeps restarting.
    struct RestartingEngine {
        inner: MockRuntime,
        subscriptions: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for RestartingEngine {
        async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
            self.inner.list_containers(all).await
        }

        async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
            self.inner.inspect_container(id).await
        }

        async fn create_container(&self, opts: &CreateOptions) -> RuntimeResult<String> {
            self.inner.create_container(opts).await
        }

        async fn start_container(&self, id: &str) -> RuntimeResult<()> {
            self.inner.start_container(id).await
        }

        async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
            self.inner.stop_container(id, grace).await
        }

        async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
            self.inner.wait_container(id).await
        }

        async fn remove_container(&self, id: &str, opts: RemoveOptions) -> RuntimeResult<()> {
            self.inner.remove_container(id, opts).await
        }

        async fn pull_image(&self, image: &ImageRef) -> RuntimeResult<()> {
            self.inner.pull_image(image).await
        }

        async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>> {
            if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: "engine starting".into(),
                });
            }
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        runtime: Arc<MockRuntime>,
        register: Register,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());
        let (tx, rx) = watch::channel(false);
        let register = Register::new(
            "10.0.0.1",
            store.clone(),
            runtime.clone(),
            Discovery::new("skydns.local"),
            rx,
        );
        Harness { store, runtime, register, _shutdown: tx }
    }

    async fn run_container(runtime: &MockRuntime, name: &str) -> String {
        let id = runtime
            .create_container(&CreateOptions {
                name: name.to_string(),
                image: "nginx:1.18".into(),
                env: vec![
                    "FLOTILLA_APP_NAME=shop".into(),
                    "FLOTILLA_SERVICE_HTTP=80".into(),
                    "FLOTILLA_ROLE_HTTP=web".into(),
                ],
                exposed_ports: vec![80],
                publish_all_ports: true,
                ..CreateOptions::default()
            })
            .await
            .unwrap();
        runtime.start_container(&id).await.unwrap();
        id
    }

    async fn announcement(store: &MemoryStore, key: &str) -> Announcement {
        let node = store.get(key, false, false).await.unwrap();
        serde_json::from_str(node.value_str()).unwrap()
    }

    #[tokio::test]
    async fn test_add_publishes_load_and_services() {
        let h = harness();
        let id = run_container(&h.runtime, "shop---api").await;
        h.register.add(&id).await;

        let keys = h.store.keys();
        assert!(keys.contains(&format!("/hosts/10.0.0.1/containers/{id}")));
        let ann = announcement(&h.store, "/skydns/local/skydns/shop/http").await;
        assert_eq!(ann.host, "10.0.0.1");
        assert_eq!(ann.port, 32768);
        let web = announcement(&h.store, "/skydns/local/skydns/web/shop").await;
        assert_eq!(web, ann);
    }

    #[tokio::test]
    async fn test_private_container_is_never_registered() {
        let h = harness();
        let id = run_container(&h.runtime, "__ambassador").await;
        h.register.add(&id).await;
        h.register.remove(&id).await;
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_remove_after_container_is_gone() {
        let h = harness();
        let id = run_container(&h.runtime, "shop---api").await;
        h.register.add(&id).await;

        h.runtime
            .remove_container(&id, RemoveOptions { force: true, remove_volumes: true })
            .await
            .unwrap();
        h.register.remove(&id).await;
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_retract_leaves_other_nodes_announcement() {
        let h = harness();
        let id = run_container(&h.runtime, "shop---api").await;
        h.register.add(&id).await;

        // Another replica took over the shared path.
        h.store
            .set("/skydns/local/skydns/shop/http", r#"{"host":"10.0.0.2","port":40000}"#)
            .await
            .unwrap();
        h.register.remove(&id).await;

        let ann = announcement(&h.store, "/skydns/local/skydns/shop/http").await;
        assert_eq!(ann.host, "10.0.0.2");
        assert!(!h.store.keys().iter().any(|k| k.starts_with("/hosts/")));
        assert!(!h.store.keys().contains(&"/skydns/local/skydns/web/shop".to_string()));
    }

    #[tokio::test]
    async fn test_loop_follows_events_and_syncs_existing() {
        let h = harness();
        let existing = run_container(&h.runtime, "shop---old").await;

        let Harness { store, runtime, register, _shutdown } = h;
        let register = Arc::new(register);
        let handle = Arc::clone(&register).start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.keys().contains(&format!("/hosts/10.0.0.1/containers/{existing}")));

        let started = run_container(&runtime, "shop---new").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.keys().contains(&format!("/hosts/10.0.0.1/containers/{started}")));

        runtime.stop_container(&started, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.keys().contains(&format!("/hosts/10.0.0.1/containers/{started}")));

        _shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_loop_resubscribes_after_event_stream_ends() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(RestartingEngine {
            inner: MockRuntime::new(),
            subscriptions: AtomicUsize::new(0),
        });
        let (shutdown, rx) = watch::channel(false);
        let register = Arc::new(
            Register::new(
                "10.0.0.1",
                store.clone(),
                engine.clone(),
                Discovery::new("skydns.local"),
                rx,
            )
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(10),
                jitter: 0.0,
            }),
        );
        let handle = Arc::clone(&register).start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(engine.subscriptions.load(Ordering::SeqCst) >= 3);

        // Its start event is never delivered; only a re-sync can see it.
        let id = run_container(&engine.inner, "shop---api").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.keys().contains(&format!("/hosts/10.0.0.1/containers/{id}")));
        assert!(!handle.is_finished());

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
