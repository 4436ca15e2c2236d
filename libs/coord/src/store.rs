//! The coordination store capability contract.
//!
//! Components depend on [`KvStore`] rather than a concrete client. The wire
//! types mirror the etcd v2 key API so that [`EtcdClient`](crate::EtcdClient)
//! can deserialize responses directly into them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// A key or directory in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Absolute key, e.g. `/apps/web/nginx/manifest`.
    pub key: String,

    /// Value for leaf keys. Absent for directories and on delete events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Whether this node is a directory.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,

    /// Children (only for directories fetched with `get`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,

    /// Store index of the last modification.
    #[serde(default)]
    pub modified_index: u64,

    /// Store index at creation.
    #[serde(default)]
    pub created_index: u64,
}

impl Node {
    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// The value, or an empty string for directories.
    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }

    /// Find a direct child by its full key.
    pub fn child(&self, key: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.key == key)
    }
}

/// The kind of change a watch notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    #[serde(other)]
    Unknown,
}

impl Action {
    /// Whether the action leaves a value at the key.
    pub fn is_upsert(self) -> bool {
        matches!(
            self,
            Action::Set | Action::Create | Action::Update | Action::CompareAndSwap
        )
    }

    /// Whether the action removes the key.
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            Action::Delete | Action::Expire | Action::CompareAndDelete
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Get => "get",
            Action::Set => "set",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Expire => "expire",
            Action::CompareAndSwap => "compareAndSwap",
            Action::CompareAndDelete => "compareAndDelete",
            Action::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One change notification (also the body of every etcd v2 write response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub action: Action,
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
}

/// Condition for compare-and-swap / compare-and-delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The current value must equal this.
    PrevValue(String),
    /// The current modification index must equal this.
    PrevIndex(u64),
}

/// Capabilities the agent needs from the coordination store.
///
/// All operations are single requests; none retries internally.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key. For directories, `recursive` includes the whole subtree
    /// and `sorted` orders children by key.
    async fn get(&self, key: &str, sorted: bool, recursive: bool) -> StoreResult<Node>;

    /// Unconditionally set a leaf value, creating parent directories.
    async fn set(&self, key: &str, value: &str) -> StoreResult<Node>;

    /// Unconditionally delete a key (`recursive` for directories).
    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<Node>;

    /// Set `value` only if `prev` holds for the current value.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev: Precondition,
    ) -> StoreResult<Node>;

    /// Delete only if `prev` holds for the current value.
    async fn compare_and_delete(&self, key: &str, prev: Precondition) -> StoreResult<Node>;

    /// Atomically append a child under `dir` with a store-assigned key that
    /// sorts after every previously appended child.
    async fn create_in_order(&self, dir: &str, value: &str) -> StoreResult<Node>;

    /// Block until one change happens under `prefix`.
    ///
    /// With `wait_index` set, the first change at or after that index is
    /// returned (possibly from history); otherwise the next change from now.
    async fn watch(
        &self,
        prefix: &str,
        wait_index: Option<u64>,
        recursive: bool,
    ) -> StoreResult<WatchEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_deserializes_etcd_body() {
        let body = r#"{
            "action": "set",
            "node": {"key": "/apps/web/nginx/manifest", "value": "{}", "modifiedIndex": 7, "createdIndex": 7},
            "prevNode": {"key": "/apps/web/nginx/manifest", "value": "{\"image\":\"a\"}", "modifiedIndex": 5, "createdIndex": 5}
        }"#;
        let event: WatchEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.action, Action::Set);
        assert_eq!(event.node.modified_index, 7);
        assert_eq!(event.node.name(), "manifest");
        assert_eq!(event.prev_node.unwrap().modified_index, 5);
    }

    #[test]
    fn test_unknown_action_is_tolerated() {
        let body = r#"{"action": "touch", "node": {"key": "/a"}}"#;
        let event: WatchEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.action, Action::Unknown);
        assert!(!event.action.is_upsert());
        assert!(!event.action.is_removal());
    }

    #[test]
    fn test_action_classification() {
        assert!(Action::Set.is_upsert());
        assert!(Action::CompareAndSwap.is_upsert());
        assert!(Action::Delete.is_removal());
        assert!(Action::Expire.is_removal());
        assert_eq!(Action::CompareAndDelete.to_string(), "compareAndDelete");
    }

    #[test]
    fn test_directory_listing_deserializes() {
        let body = r#"{
            "key": "/apps/web/nginx/hosts", "dir": true,
            "nodes": [
                {"key": "/apps/web/nginx/hosts/00000000000000000012", "value": "{\"addr\":\"10.0.0.1\"}", "modifiedIndex": 12, "createdIndex": 12},
                {"key": "/apps/web/nginx/hosts/00000000000000000013", "value": "{\"addr\":\"10.0.0.2\"}", "modifiedIndex": 13, "createdIndex": 13}
            ],
            "modifiedIndex": 11, "createdIndex": 11
        }"#;
        let node: Node = serde_json::from_str(body).unwrap();
        assert!(node.dir);
        assert_eq!(node.nodes.len(), 2);
        assert_eq!(node.nodes[0].name(), "00000000000000000012");
        assert!(node.child("/apps/web/nginx/hosts/00000000000000000013").is_some());
    }
}
