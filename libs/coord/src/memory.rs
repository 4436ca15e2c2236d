//! In-process coordination store.
//!
//! `MemoryStore` implements the full [`KvStore`] contract behind a single
//! mutex, so every operation is linearizable. It keeps a bounded event
//! history so watches with a `wait_index` can catch up, exactly like etcd.
//!
//! Directories are implicit: a directory exists while it has at least one
//! descendant key.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{Action, KvStore, Node, Precondition, WatchEvent};

/// Number of events retained for `wait_index` catch-up (etcd's default).
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
}

impl Entry {
    fn to_node(&self, key: &str) -> Node {
        Node {
            key: key.to_string(),
            value: Some(self.value.clone()),
            dir: false,
            nodes: Vec::new(),
            modified_index: self.modified_index,
            created_index: self.created_index,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<WatchEvent>,
    /// Bumped by `disconnect_watchers` to fail all in-flight watches.
    generation: u64,
}

/// Linearizable in-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store index (index of the last write).
    pub fn current_index(&self) -> u64 {
        self.state().index
    }

    /// All leaf keys, in key order.
    pub fn keys(&self) -> Vec<String> {
        self.state().entries.keys().cloned().collect()
    }

    /// Fail every in-flight watch with [`StoreError::Disconnected`],
    /// simulating a dropped long-poll connection.
    pub fn disconnect_watchers(&self) {
        self.state().generation += 1;
        self.changed.notify_waiters();
        debug!("memory store: watchers disconnected");
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn commit(&self, inner: &mut Inner, event: WatchEvent) {
        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(event);
        self.changed.notify_waiters();
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" || dir.is_empty() {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

fn has_descendants(entries: &BTreeMap<String, Entry>, dir: &str) -> bool {
    let prefix = child_prefix(dir);
    entries
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(k, _)| k.starts_with(&prefix))
}

fn dir_node(entries: &BTreeMap<String, Entry>, dir: &str, recursive: bool) -> Option<Node> {
    let prefix = child_prefix(dir);
    let mut children = Vec::new();
    let mut subdirs = BTreeSet::new();
    let mut created_index = u64::MAX;
    let mut modified_index = 0;

    for (key, entry) in entries.range(prefix.clone()..) {
        if !key.starts_with(&prefix) {
            break;
        }
        created_index = created_index.min(entry.created_index);
        modified_index = modified_index.max(entry.modified_index);

        let rest = &key[prefix.len()..];
        match rest.split_once('/') {
            None => children.push(entry.to_node(key)),
            Some((name, _)) => {
                let sub = format!("{prefix}{name}");
                if subdirs.insert(sub.clone()) {
                    let child = if recursive {
                        dir_node(entries, &sub, true)?
                    } else {
                        Node {
                            key: sub,
                            dir: true,
                            ..Node::default()
                        }
                    };
                    children.push(child);
                }
            }
        }
    }

    if modified_index == 0 {
        return None;
    }
    children.sort_by(|a, b| a.key.cmp(&b.key));

    Some(Node {
        key: dir.to_string(),
        value: None,
        dir: true,
        nodes: children,
        modified_index,
        created_index,
    })
}

/// Reject writes below an existing leaf (etcd error code 104).
fn ensure_parents(entries: &BTreeMap<String, Entry>, key: &str) -> StoreResult<()> {
    for (pos, _) in key.match_indices('/').skip(1) {
        if entries.contains_key(&key[..pos]) {
            return Err(StoreError::Api {
                code: 104,
                message: format!("Not a directory: {}", &key[..pos]),
            });
        }
    }
    Ok(())
}

fn watch_matches(prefix: &str, key: &str, recursive: bool) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if key == prefix || (key.is_empty() && prefix.is_empty()) {
        return true;
    }
    recursive && (prefix.is_empty() || key.starts_with(&format!("{prefix}/")))
}

fn check(key: &str, entry: &Entry, prev: &Precondition) -> StoreResult<()> {
    let ok = match prev {
        Precondition::PrevValue(v) => entry.value == *v,
        Precondition::PrevIndex(i) => entry.modified_index == *i,
    };
    if ok {
        return Ok(());
    }
    let cause = match prev {
        Precondition::PrevValue(v) => format!("[{v} != {}]", entry.value),
        Precondition::PrevIndex(i) => format!("[{i} != {}]", entry.modified_index),
    };
    Err(StoreError::TestFailed {
        key: key.to_string(),
        cause,
    })
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str, _sorted: bool, recursive: bool) -> StoreResult<Node> {
        let key = normalize(key);
        let inner = self.state();
        if let Some(entry) = inner.entries.get(&key) {
            return Ok(entry.to_node(&key));
        }
        dir_node(&inner.entries, &key, recursive).ok_or(StoreError::NotFound(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<Node> {
        let key = normalize(key);
        let mut inner = self.state();
        if has_descendants(&inner.entries, &key) {
            return Err(StoreError::NotAFile(key));
        }
        ensure_parents(&inner.entries, &key)?;
        inner.index += 1;
        let index = inner.index;
        let prev = inner.entries.get(&key).cloned();
        let entry = Entry {
            value: value.to_string(),
            created_index: prev.as_ref().map_or(index, |p| p.created_index),
            modified_index: index,
        };
        let node = entry.to_node(&key);
        inner.entries.insert(key.clone(), entry);
        let event = WatchEvent {
            action: Action::Set,
            node: node.clone(),
            prev_node: prev.map(|p| p.to_node(&key)),
        };
        self.commit(&mut inner, event);
        Ok(node)
    }

    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<Node> {
        let key = normalize(key);
        let mut inner = self.state();

        if let Some(prev) = inner.entries.remove(&key) {
            inner.index += 1;
            let node = Node {
                key: key.clone(),
                modified_index: inner.index,
                created_index: prev.created_index,
                ..Node::default()
            };
            let event = WatchEvent {
                action: Action::Delete,
                node: node.clone(),
                prev_node: Some(prev.to_node(&key)),
            };
            self.commit(&mut inner, event);
            return Ok(node);
        }

        if !has_descendants(&inner.entries, &key) {
            return Err(StoreError::NotFound(key));
        }
        if !recursive {
            return Err(StoreError::NotAFile(key));
        }

        let prefix = child_prefix(&key);
        inner.entries.retain(|k, _| !k.starts_with(&prefix));
        inner.index += 1;
        let node = Node {
            key: key.clone(),
            dir: true,
            modified_index: inner.index,
            ..Node::default()
        };
        let event = WatchEvent {
            action: Action::Delete,
            node: node.clone(),
            prev_node: None,
        };
        self.commit(&mut inner, event);
        Ok(node)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev: Precondition,
    ) -> StoreResult<Node> {
        let key = normalize(key);
        let mut inner = self.state();
        let current = inner
            .entries
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check(&key, &current, &prev)?;

        inner.index += 1;
        let entry = Entry {
            value: value.to_string(),
            created_index: current.created_index,
            modified_index: inner.index,
        };
        let node = entry.to_node(&key);
        inner.entries.insert(key.clone(), entry);
        let event = WatchEvent {
            action: Action::CompareAndSwap,
            node: node.clone(),
            prev_node: Some(current.to_node(&key)),
        };
        self.commit(&mut inner, event);
        Ok(node)
    }

    async fn compare_and_delete(&self, key: &str, prev: Precondition) -> StoreResult<Node> {
        let key = normalize(key);
        let mut inner = self.state();
        let current = inner
            .entries
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check(&key, &current, &prev)?;

        inner.entries.remove(&key);
        inner.index += 1;
        let node = Node {
            key: key.clone(),
            modified_index: inner.index,
            created_index: current.created_index,
            ..Node::default()
        };
        let event = WatchEvent {
            action: Action::CompareAndDelete,
            node: node.clone(),
            prev_node: Some(current.to_node(&key)),
        };
        self.commit(&mut inner, event);
        Ok(node)
    }

    async fn create_in_order(&self, dir: &str, value: &str) -> StoreResult<Node> {
        let dir = normalize(dir);
        let mut inner = self.state();
        if inner.entries.contains_key(&dir) {
            return Err(StoreError::NotAFile(dir));
        }
        ensure_parents(&inner.entries, &dir)?;
        inner.index += 1;
        let index = inner.index;
        let key = format!("{dir}/{index:020}");
        let entry = Entry {
            value: value.to_string(),
            created_index: index,
            modified_index: index,
        };
        let node = entry.to_node(&key);
        inner.entries.insert(key, entry);
        let event = WatchEvent {
            action: Action::Create,
            node: node.clone(),
            prev_node: None,
        };
        self.commit(&mut inner, event);
        Ok(node)
    }

    async fn watch(
        &self,
        prefix: &str,
        wait_index: Option<u64>,
        recursive: bool,
    ) -> StoreResult<WatchEvent> {
        let prefix = normalize(prefix);
        let (start, generation) = {
            let inner = self.state();
            let start = wait_index.unwrap_or(inner.index + 1);
            if let Some(oldest) = inner.history.front() {
                if start < oldest.node.modified_index && inner.history.len() == HISTORY_LIMIT {
                    return Err(StoreError::IndexCleared(format!(
                        "the requested history has been cleared [{}/{start}]",
                        oldest.node.modified_index
                    )));
                }
            }
            (start, inner.generation)
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.state();
                if inner.generation != generation {
                    return Err(StoreError::Disconnected(prefix));
                }
                let found = inner.history.iter().find(|e| {
                    e.node.modified_index >= start
                        && watch_matches(&prefix, &e.node.key, recursive)
                });
                if let Some(event) = found {
                    return Ok(event.clone());
                }
            }

            notified.await;
        }
    }
}
