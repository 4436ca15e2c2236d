//! Agent error type.

use flotilla_coord::StoreError;
use thiserror::Error;

use crate::image::ImageRefError;
use crate::manifest::ManifestError;
use crate::runtime::RuntimeError;

/// Errors surfaced by agent components.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("image reference: {0}")]
    Image(#[from] ImageRefError),

    #[error("invalid slot record at {key}: {source}")]
    SlotRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type AgentResult<T> = Result<T, AgentError>;
