//! Coordination store access for flotilla.
//!
//! Every agent in a cluster talks to one shared, hierarchical key-value store
//! (the etcd v2 key API). This crate holds the narrow capability contract the
//! agent depends on, plus its implementations:
//!
//! ```text
//! KvStore (trait)
//! ├── EtcdClient   (etcd v2 over HTTP)
//! └── MemoryStore  (in-process, linearizable; tests and single-node dev)
//!
//! Watcher ── wraps KvStore::watch into a reconnecting, cancellable stream
//! ```
//!
//! ## Modules
//!
//! - `store`: the `KvStore` trait and wire types (`Node`, `WatchEvent`)
//! - `etcd`: HTTP client for a real etcd cluster
//! - `memory`: in-memory store with ordered-append and watch history
//! - `watcher`: long-lived notification stream with backoff reconnect

pub mod error;
pub mod etcd;
pub mod memory;
pub mod store;
pub mod watcher;

pub use error::{StoreError, StoreResult};
pub use etcd::EtcdClient;
pub use memory::MemoryStore;
pub use store::{Action, KvStore, Node, Precondition, WatchEvent};
pub use watcher::{shutdown_requested, BackoffPolicy, WatchStream, Watcher};
