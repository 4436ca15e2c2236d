//! Scale-limited slot acquisition.
//!
//! Each manifest has a `hosts` directory of slot records created with the
//! store's ordered-append. For scale *N*, the first *N* records in key order
//! own the *N* replica slots. A node claims by appending its own record and
//! then re-reading: the re-read, not the append, decides the outcome, so two
//! nodes racing for the last slot always agree on the winner.
//!
//! Records are never updated. Only the node named in a record deletes it.
//! A record whose body does not parse still takes up its position, but it
//! names no node, so nobody owns or deletes it.

use std::sync::Arc;

use flotilla_coord::{KvStore, Node, Precondition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::manifest::{Manifest, ManifestId};

/// Status written into a freshly claimed slot.
pub const STATUS_CREATING: &str = "creating";

/// Body of a slot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub addr: String,
    pub status: String,
}

/// A slot record together with its position in the store. `record` is
/// `None` when the body does not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub key: String,
    pub modified_index: u64,
    pub record: Option<HostRecord>,
}

impl Slot {
    /// Node named in the record, if it parses.
    pub fn addr(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.addr.as_str())
    }
}

/// Slot claims for this node.
pub struct SlotTable {
    store: Arc<dyn KvStore>,
    node_addr: String,
}

impl SlotTable {
    pub fn new(store: Arc<dyn KvStore>, node_addr: impl Into<String>) -> Self {
        Self {
            store,
            node_addr: node_addr.into(),
        }
    }

    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    /// All slot records of a manifest in insertion order, including those
    /// whose body does not parse.
    pub async fn list(&self, id: &ManifestId) -> AgentResult<Vec<Slot>> {
        let dir = match self.store.get(&id.hosts_key(), true, false).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children: Vec<&Node> = dir.nodes.iter().filter(|n| !n.dir).collect();
        children.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(children
            .into_iter()
            .map(|node| {
                let record = match parse_record(node) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(error = %e, "Unparseable slot record");
                        None
                    }
                };
                Slot {
                    key: node.key.clone(),
                    modified_index: node.modified_index,
                    record,
                }
            })
            .collect())
    }

    /// Whether this node holds one of the first `scale` slots.
    pub async fn holds(&self, manifest: &Manifest) -> AgentResult<bool> {
        let slots = self.list(&manifest.id).await?;
        Ok(self.owns(&slots, manifest.scale))
    }

    fn owns(&self, slots: &[Slot], scale: u32) -> bool {
        let owners = slots.len().min(scale as usize);
        slots[..owners]
            .iter()
            .any(|s| s.addr() == Some(self.node_addr.as_str()))
    }

    /// Try to take one replica slot of `manifest`.
    ///
    /// Returns `true` when this node owns a slot afterwards, including when it
    /// already did. On a lost race the record just appended is removed again
    /// so it does not occupy a position ahead of later claimants.
    pub async fn acquire(&self, manifest: &Manifest) -> AgentResult<bool> {
        let id = &manifest.id;
        if self.holds(manifest).await? {
            debug!(app = %id.app, container = %id.container, node = %self.node_addr, "Slot already held");
            return Ok(true);
        }

        let record = HostRecord {
            addr: self.node_addr.clone(),
            status: STATUS_CREATING.to_string(),
        };
        let body = serde_json::to_string(&record).map_err(|source| AgentError::SlotRecord {
            key: id.hosts_key(),
            source,
        })?;
        let created = self.store.create_in_order(&id.hosts_key(), &body).await?;
        debug!(app = %id.app, container = %id.container, key = %created.key, "Appended slot record");

        if self.holds(manifest).await? {
            info!(app = %id.app, container = %id.container, node = %self.node_addr, scale = manifest.scale, "Acquired slot");
            return Ok(true);
        }

        info!(app = %id.app, container = %id.container, node = %self.node_addr, "Lost slot race");
        if let Err(e) = self
            .store
            .compare_and_delete(&created.key, Precondition::PrevIndex(created.modified_index))
            .await
        {
            warn!(key = %created.key, error = %e, "Failed to remove surplus slot record");
        }
        Ok(false)
    }

    /// Delete every slot record of `id` that names this node. Returns how
    /// many were deleted.
    pub async fn release(&self, id: &ManifestId) -> AgentResult<usize> {
        let mut released = 0;
        for slot in self.list(id).await? {
            if slot.addr() != Some(self.node_addr.as_str()) {
                continue;
            }
            match self.store.delete(&slot.key, false).await {
                Ok(_) => released += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if released > 0 {
            info!(app = %id.app, container = %id.container, node = %self.node_addr, released, "Released slot");
        }
        Ok(released)
    }
}

fn parse_record(node: &Node) -> AgentResult<HostRecord> {
    serde_json::from_str(node.value_str()).map_err(|source| AgentError::SlotRecord {
        key: node.key.clone(),
        source,
    })
}
