//! Flotilla Agent Library
//!
//! Every node in a flotilla cluster runs the same agent. There is no central
//! scheduler: each agent watches application manifests in the shared store
//! and decides for itself whether to run a replica, using ordered-append slot
//! records to keep the replica count within each manifest's scale.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler  (watch /apps → rank → stagger → acquire slot → run/teardown)
//! ├── LoadRanker   (per-node container counts under /hosts)
//! └── SlotTable    (scale-limited claims under /apps/<app>/<c>/hosts)
//!
//! Register   (runtime events → /hosts load records + service announcements)
//! ```
//!
//! Both loops share only the store (`KvStore`) and the runtime
//! (`ContainerRuntime`).
//!
//! ## Modules
//!
//! - `manifest`: manifest model and derived environment
//! - `image`: image reference parsing
//! - `cluster`: load ranking
//! - `slots`: slot acquisition and release
//! - `scheduler`: placement engine
//! - `register`: service registration bridge
//! - `service`: announcement derivation
//! - `runtime`: runtime trait and mock
//! - `docker`: Docker Engine API client

pub mod cluster;
pub mod config;
pub mod docker;
pub mod error;
pub mod image;
pub mod manifest;
pub mod register;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod slots;

pub use cluster::LoadRanker;
pub use config::Config;
pub use docker::DockerClient;
pub use error::{AgentError, AgentResult};
pub use image::ImageRef;
pub use manifest::{Manifest, ManifestId, ManifestKey, SubPath};
pub use register::Register;
pub use runtime::{ContainerRuntime, MockRuntime};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use service::{Announcement, Discovery, Service};
pub use slots::{HostRecord, SlotTable};
