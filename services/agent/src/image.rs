//! Image reference parsing.
//!
//! The runtime pulls by repository and tag separately, so a manifest's
//! `image` string is split here. A missing tag means `latest`; a registry
//! host with a port (`localhost:5000/app`) is part of the repository.

use std::fmt;

use thiserror::Error;

/// Default tag when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("empty image reference")]
    Empty,

    #[error("invalid image reference: {0}")]
    Invalid(String),
}

/// A parsed `repository[:tag]` or `repository@digest` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    /// Tag, or a digest such as `sha256:...` for pinned references.
    pub tag: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, ImageRefError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ImageRefError::Empty);
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ImageRefError::Invalid(image.to_string()));
        }

        if let Some((repository, digest)) = image.split_once('@') {
            if repository.is_empty() || digest.is_empty() {
                return Err(ImageRefError::Invalid(image.to_string()));
            }
            return Ok(Self {
                repository: repository.to_string(),
                tag: digest.to_string(),
            });
        }

        // Only a colon after the first path segment separates a tag; one in
        // the first segment may be a registry port.
        let (host, rest) = match image.split_once('/') {
            Some((host, rest)) => (Some(host), rest),
            None => (None, image),
        };
        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (rest, ""),
        };
        if name.is_empty() {
            return Err(ImageRefError::Invalid(image.to_string()));
        }

        let repository = match host {
            Some(host) => format!("{host}/{name}"),
            None => name.to_string(),
        };
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };

        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }

    /// Whether the reference is pinned by digest.
    pub fn is_digest(&self) -> bool {
        self.tag.contains(':')
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_digest() {
            write!(f, "{}@{}", self.repository, self.tag)
        } else {
            write!(f, "{}:{}", self.repository, self.tag)
        }
    }
}
