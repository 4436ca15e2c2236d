//! Placement engine.
//!
//! The scheduler watches `/apps` and reacts to each notification inline:
//!
//! - manifest written: rank this node's load, sleep `order × stagger`, try to
//!   take a slot. A winner pulls the image and replaces the container; a
//!   loser tears down whatever it still runs for that manifest and gives its
//!   slot records back.
//! - manifest removed: tear down and release.
//! - slot records changed: [`Scheduler::on_slot_change`].
//!
//! Every reaction re-reads the store rather than trusting the event stream,
//! so a notification lost during a watch reconnect is repaired by the next
//! one for the same manifest.

use std::sync::Arc;
use std::time::Duration;

use flotilla_coord::{Action, KvStore, WatchEvent, Watcher};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::LoadRanker;
use crate::error::AgentResult;
use crate::image::ImageRef;
use crate::manifest::{Manifest, ManifestId, ManifestKey, SubPath, APPS_ROOT};
use crate::runtime::{ContainerRuntime, CreateOptions, RemoveOptions};
use crate::slots::SlotTable;

/// Name of the local link proxy container, if one runs on this node.
pub const AMBASSADOR_NAME: &str = "__ambassador";

/// Alias the ambassador is linked under.
pub const AMBASSADOR_ALIAS: &str = "backends";

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay per load-order step before claiming a slot.
    pub stagger_unit: Duration,

    /// Grace period for stopping a container.
    pub stop_timeout: Duration,

    /// DNS suffix for linked services.
    pub discovery_domain: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stagger_unit: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(60),
            discovery_domain: "skydns.local".to_string(),
        }
    }
}

/// Wait before claiming a slot at load order `order`. Saturates instead of
/// overflowing.
fn stagger_delay(unit: Duration, order: u32) -> Duration {
    unit.checked_mul(order).unwrap_or(Duration::MAX)
}

/// Watches manifests and places containers on this node.
pub struct Scheduler {
    node_addr: String,
    runtime: Arc<dyn ContainerRuntime>,
    watcher: Watcher,
    ranker: LoadRanker,
    slots: SlotTable,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        node_addr: impl Into<String>,
        store: Arc<dyn KvStore>,
        runtime: Arc<dyn ContainerRuntime>,
        watcher: Watcher,
        config: SchedulerConfig,
    ) -> Self {
        let node_addr = node_addr.into();
        Self {
            ranker: LoadRanker::new(Arc::clone(&store), node_addr.clone()),
            slots: SlotTable::new(store, node_addr.clone()),
            node_addr,
            runtime,
            watcher,
            config,
        }
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Spawn the scheduling loop. The handle completes once the watch is
    /// cancelled.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run the scheduling loop until the watch is cancelled.
    pub async fn run(&self) {
        info!(node = %self.node_addr, "Starting scheduling loop");
        let mut events = self.watcher.watch(APPS_ROOT, true);
        while let Some(event) = events.next().await {
            self.handle_event(&event).await;
        }
        info!(node = %self.node_addr, "Scheduling loop stopped");
    }

    /// React to one notification under `/apps`.
    pub async fn handle_event(&self, event: &WatchEvent) {
        let Some(key) = ManifestKey::parse(&event.node.key) else {
            debug!(key = %event.node.key, "Ignoring key outside any manifest");
            return;
        };

        match key.sub_path {
            SubPath::Manifest if event.action.is_upsert() => match event.node.value.as_deref() {
                Some(body) => self.place(key.id, body).await,
                None => warn!(app = %key.id.app, container = %key.id.container, "Manifest event without a value"),
            },
            SubPath::Manifest | SubPath::Root if event.action.is_removal() => {
                self.unplace(&key.id).await
            }
            SubPath::Hosts(slot) => self.on_slot_change(&key.id, &slot, event.action).await,
            other => {
                debug!(app = %key.id.app, container = %key.id.container, sub_path = ?other, action = %event.action, "Ignoring event");
            }
        }
    }

    /// Slot records of a manifest changed. Ownership is re-derived on the
    /// next manifest notification, so nothing is done here yet.
    pub async fn on_slot_change(&self, id: &ManifestId, slot: &str, action: Action) {
        debug!(app = %id.app, container = %id.container, slot, %action, "Slot records changed");
    }

    async fn place(&self, id: ManifestId, body: &str) {
        let manifest = match Manifest::parse(id, body, &self.config.discovery_domain) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "Dropping invalid manifest");
                return;
            }
        };
        let image = match ImageRef::parse(&manifest.image) {
            Ok(image) => image,
            Err(e) => {
                error!(app = %manifest.id.app, container = %manifest.id.container, image = %manifest.image, error = %e, "Dropping manifest with invalid image");
                return;
            }
        };

        let order = self.ranker.load_order().await;
        if order > 0 {
            let delay = stagger_delay(self.config.stagger_unit, order);
            debug!(app = %manifest.id.app, container = %manifest.id.container, order, delay_ms = delay.as_millis() as u64, "Staggering slot claim");
            tokio::time::sleep(delay).await;
        }

        match self.slots.acquire(&manifest).await {
            Ok(true) => {
                if let Err(e) = self.run_container(&manifest, &image).await {
                    error!(app = %manifest.id.app, container = %manifest.id.container, error = %e, "Failed to run container");
                }
            }
            Ok(false) => {
                debug!(app = %manifest.id.app, container = %manifest.id.container, "No slot for this node");
                self.unplace(&manifest.id).await;
            }
            Err(e) => {
                warn!(app = %manifest.id.app, container = %manifest.id.container, error = %e, "Slot acquisition failed");
            }
        }
    }

    /// Pull the image and replace any existing container of the same name.
    async fn run_container(&self, manifest: &Manifest, image: &ImageRef) -> AgentResult<()> {
        let name = manifest.container_name();
        self.runtime.pull_image(image).await?;

        match self
            .runtime
            .remove_container(&name, RemoveOptions { force: true, remove_volumes: false })
            .await
        {
            Ok(()) => debug!(%name, "Removed previous container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut links = Vec::new();
        if self.runtime.inspect_container(AMBASSADOR_NAME).await.is_ok() {
            links.push(format!("{AMBASSADOR_NAME}:{AMBASSADOR_ALIAS}"));
        }

        let opts = CreateOptions {
            name: name.clone(),
            image: image.to_string(),
            env: manifest.env_list(),
            exposed_ports: manifest.exposed_ports(),
            command: manifest.command.clone(),
            publish_all_ports: true,
            links,
        };
        let container_id = self.runtime.create_container(&opts).await?;
        self.runtime.start_container(&container_id).await?;

        info!(app = %manifest.id.app, container = %manifest.id.container, %name, %container_id, %image, "Container started");
        Ok(())
    }

    /// Tear down the local container of `id` and give back its slots.
    async fn unplace(&self, id: &ManifestId) {
        self.teardown(&id.container_name()).await;
        if let Err(e) = self.slots.release(id).await {
            warn!(app = %id.app, container = %id.container, error = %e, "Failed to release slot");
        }
    }

    /// Stop, wait for and remove a container. Each step is attempted even if
    /// an earlier one failed; a missing container is already torn down.
    pub async fn teardown(&self, name: &str) {
        match self.runtime.inspect_container(name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(%name, "No container to tear down");
                return;
            }
            Err(e) => warn!(%name, error = %e, "Failed to inspect container"),
        }

        if let Err(e) = self
            .runtime
            .stop_container(name, self.config.stop_timeout)
            .await
        {
            warn!(%name, error = %e, "Failed to stop container");
        }
        if let Err(e) = self.runtime.wait_container(name).await {
            warn!(%name, error = %e, "Failed to wait for container");
        }
        match self
            .runtime
            .remove_container(name, RemoveOptions { force: false, remove_volumes: true })
            .await
        {
            Ok(()) => info!(%name, "Container removed"),
            Err(e) => warn!(%name, error = %e, "Failed to remove container"),
        }
    }
}
