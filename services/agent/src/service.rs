//! Service announcements for discovery.
//!
//! A running container declares its services through environment variables
//! written at placement time (see [`Manifest::parse`](crate::Manifest::parse)).
//! Joined with the ports the engine actually published, they become
//! SkyDNS-style announcement records in the store.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::manifest::{ENV_APP_NAME, ENV_ROLE_PREFIX, ENV_SERVICE_PREFIX};
use crate::runtime::ContainerDetails;

/// Role tag that earns an extra `web/<app>` publication.
pub const WEB_ROLE: &str = "web";

/// Where announcements live in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    domain: String,
    root: String,
}

impl Discovery {
    /// `skydns.local` maps to the root `/skydns/local/skydns`.
    pub fn new(domain: &str) -> Self {
        let domain = domain.trim_matches('.').to_string();
        let mut root = String::from("/skydns");
        for label in domain.rsplit('.').filter(|l| !l.is_empty()) {
            root.push('/');
            root.push_str(label);
        }
        Self { domain, root }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<app>/<service>`
    pub fn service_key(&self, service: &Service) -> String {
        format!("{}/{}/{}", self.root, service.app, service.name)
    }

    /// `<root>/web/<app>`
    pub fn web_key(&self, service: &Service) -> String {
        format!("{}/{}/{}", self.root, WEB_ROLE, service.app)
    }
}

/// A service exposed by a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub app: String,
    /// Lower-cased service name.
    pub name: String,
    /// Port inside the container.
    pub port: u16,
    /// Port published on the host.
    pub host_port: u16,
    pub role: Option<String>,
}

impl Service {
    pub fn is_web(&self) -> bool {
        self.role.as_deref() == Some(WEB_ROLE)
    }

    /// The record this node publishes for the service.
    pub fn announcement(&self, host: &str) -> Announcement {
        Announcement {
            host: host.to_string(),
            port: self.host_port,
            ..Announcement::default()
        }
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Body of a discovery record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ttl: u32,
}

/// Derive the services a container announces.
///
/// Containers without an app name in their environment announce nothing.
/// Services whose port was not published are skipped.
pub fn services_from(container: &ContainerDetails) -> Vec<Service> {
    let Some(app) = container.env_var(ENV_APP_NAME) else {
        return Vec::new();
    };

    let mut services: Vec<Service> = container
        .env
        .iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let suffix = key.strip_prefix(ENV_SERVICE_PREFIX)?;
            let Ok(port) = value.parse::<u16>() else {
                warn!(container = %container.name, %key, %value, "Ignoring service with invalid port");
                return None;
            };
            let Some(host_port) = container.host_port(port).and_then(|p| p.parse::<u16>().ok())
            else {
                warn!(container = %container.name, service = %suffix, port, "Service port not published");
                return None;
            };
            let role = container
                .env_var(&format!("{ENV_ROLE_PREFIX}{suffix}"))
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            Some(Service {
                app: app.to_string(),
                name: suffix.to_lowercase(),
                port,
                host_port,
                role,
            })
        })
        .collect();

    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}
