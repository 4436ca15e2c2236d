//! Cluster load ranking.
//!
//! Each node's load is the number of containers the register has recorded
//! under `/hosts/<node>/containers`. The ranker turns that into a delay
//! multiplier so lightly loaded nodes try to claim slots first.

use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla_coord::{KvStore, Node, StoreResult};
use tracing::{debug, warn};

/// Root of the per-node load tree.
pub const HOSTS_ROOT: &str = "/hosts";

/// `/hosts/<node>/containers/<id>`
pub fn load_key(node_addr: &str, container_id: &str) -> String {
    format!("{HOSTS_ROOT}/{node_addr}/containers/{container_id}")
}

/// Ranks this node against its peers by container count.
pub struct LoadRanker {
    store: Arc<dyn KvStore>,
    node_addr: String,
}

impl LoadRanker {
    pub fn new(store: Arc<dyn KvStore>, node_addr: impl Into<String>) -> Self {
        Self {
            store,
            node_addr: node_addr.into(),
        }
    }

    /// Container count per node. A missing tree is an empty map.
    pub async fn loads(&self) -> StoreResult<BTreeMap<String, usize>> {
        let root = match self.store.get(HOSTS_ROOT, false, true).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        Ok(root
            .nodes
            .iter()
            .filter(|n| n.dir)
            .map(|host| (host.name().to_string(), container_count(host)))
            .collect())
    }

    /// Number of other nodes with strictly fewer containers than this one.
    ///
    /// Never fails: store errors rank the node first.
    pub async fn load_order(&self) -> u32 {
        let loads = match self.loads().await {
            Ok(loads) => loads,
            Err(e) => {
                warn!(node = %self.node_addr, error = %e, "Failed to read host loads");
                return 0;
            }
        };
        let own = loads.get(&self.node_addr).copied().unwrap_or(0);
        let order = loads
            .iter()
            .filter(|(addr, load)| *addr != &self.node_addr && **load < own)
            .count();
        debug!(node = %self.node_addr, load = own, peers = loads.len(), order, "Computed load order");
        u32::try_from(order).unwrap_or(u32::MAX)
    }
}

fn container_count(host: &Node) -> usize {
    host.child(&format!("{}/containers", host.key))
        .map_or(0, |c| c.nodes.len())
}
