//! Application manifests.
//!
//! A manifest is the desired state of one container of one application. It
//! lives in the store at `/apps/<app>/<container>/manifest` as JSON:
//!
//! ```json
//! {
//!   "image": "nginx:1.18",
//!   "scale": 2,
//!   "env": {"KEY": "value"},
//!   "links": ["db"],
//!   "command": ["nginx", "-g", "daemon off;"],
//!   "services": {"http": {"port": 80, "role": "web"}, "metrics": 9100}
//! }
//! ```
//!
//! Parsing also derives the environment the container needs for linking and
//! for the register to announce its services later.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Root of the application key space.
pub const APPS_ROOT: &str = "/apps";

/// First local port handed to linked backends; incremented per link.
pub const BACKENDS_PORT_START: u16 = 10000;

/// Env var carrying the application name.
pub const ENV_APP_NAME: &str = "FLOTILLA_APP_NAME";

/// Env var prefix for declared services (`FLOTILLA_SERVICE_<NAME>=<port>`).
pub const ENV_SERVICE_PREFIX: &str = "FLOTILLA_SERVICE_";

/// Env var prefix for service roles (`FLOTILLA_ROLE_<NAME>=<role>`).
pub const ENV_ROLE_PREFIX: &str = "FLOTILLA_ROLE_";

/// Separator between app and container in runtime container names.
pub const NAME_SEPARATOR: &str = "---";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest for {id}: {source}")]
    Parse {
        id: ManifestId,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest for {0} has no image")]
    MissingImage(ManifestId),

    #[error("manifest for {0} declares too many links")]
    TooManyLinks(ManifestId),
}

/// Identity of a manifest: `(app, container)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestId {
    pub app: String,
    pub container: String,
}

impl ManifestId {
    pub fn new(app: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            container: container.into(),
        }
    }

    /// Runtime container name: `<app>---<container>`.
    pub fn container_name(&self) -> String {
        format!("{}{NAME_SEPARATOR}{}", self.app, self.container)
    }

    fn key_root(&self) -> String {
        format!("{APPS_ROOT}/{}/{}", self.app, self.container)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/manifest", self.key_root())
    }

    /// Directory holding the slot records.
    pub fn hosts_key(&self) -> String {
        format!("{}/hosts", self.key_root())
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.container)
    }
}

/// What part of a manifest's key tree a store key points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPath {
    /// `/apps/<app>/<container>` itself.
    Root,
    /// `/apps/<app>/<container>/manifest`.
    Manifest,
    /// `/apps/<app>/<container>/hosts[/<ordered-id>]`; empty id for the directory.
    Hosts(String),
    /// Anything else below the container.
    Other(String),
}

/// A store key under `/apps`, split into identity and sub-path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestKey {
    pub id: ManifestId,
    pub sub_path: SubPath,
}

impl ManifestKey {
    /// Split `/apps/<app>/<container>[/<rest>]`. Returns `None` for keys
    /// outside `/apps` or above the container level.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(APPS_ROOT)?.strip_prefix('/')?;
        let mut parts = rest.splitn(3, '/');
        let app = parts.next().filter(|s| !s.is_empty())?;
        let container = parts.next().filter(|s| !s.is_empty())?;

        let sub_path = match parts.next() {
            None | Some("") => SubPath::Root,
            Some("manifest") => SubPath::Manifest,
            Some("hosts") => SubPath::Hosts(String::new()),
            Some(other) => match other.strip_prefix("hosts/") {
                Some(id) => SubPath::Hosts(id.to_string()),
                None => SubPath::Other(other.to_string()),
            },
        };

        Some(Self {
            id: ManifestId::new(app, container),
            sub_path,
        })
    }
}

/// A declared service: a bare port, or a port with a role tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ServiceDecl {
    Port(u16),
    Detailed {
        port: u16,
        #[serde(default)]
        role: Option<String>,
    },
}

impl ServiceDecl {
    pub fn port(&self) -> u16 {
        match self {
            ServiceDecl::Port(port) => *port,
            ServiceDecl::Detailed { port, .. } => *port,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            ServiceDecl::Port(_) => None,
            ServiceDecl::Detailed { role, .. } => role.as_deref().filter(|r| !r.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestBody {
    #[serde(default)]
    image: String,
    #[serde(default)]
    scale: u32,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    services: BTreeMap<String, ServiceDecl>,
}

/// A parsed manifest with its derived runtime environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub id: ManifestId,
    pub image: String,
    /// Desired replica count, at least 1.
    pub scale: u32,
    /// User env plus derived app, service, and link entries.
    pub env: BTreeMap<String, String>,
    pub links: Vec<String>,
    pub command: Vec<String>,
    pub services: BTreeMap<String, ServiceDecl>,
}

impl Manifest {
    /// Parse a manifest body and derive its environment.
    ///
    /// `discovery_domain` is the DNS suffix linked services resolve under,
    /// e.g. `skydns.local`.
    pub fn parse(id: ManifestId, body: &str, discovery_domain: &str) -> Result<Self, ManifestError> {
        let body: ManifestBody = serde_json::from_str(body).map_err(|source| ManifestError::Parse {
            id: id.clone(),
            source,
        })?;
        if body.image.trim().is_empty() {
            return Err(ManifestError::MissingImage(id));
        }

        let mut env = body.env;
        env.insert(ENV_APP_NAME.to_string(), id.app.clone());

        for (name, decl) in &body.services {
            let upper = name.to_uppercase();
            env.insert(format!("{ENV_SERVICE_PREFIX}{upper}"), decl.port().to_string());
            if let Some(role) = decl.role() {
                env.insert(format!("{ENV_ROLE_PREFIX}{upper}"), role.to_string());
            }
        }

        for (i, link) in body.links.iter().enumerate() {
            let port = u16::try_from(i)
                .ok()
                .and_then(|i| BACKENDS_PORT_START.checked_add(i))
                .ok_or_else(|| ManifestError::TooManyLinks(id.clone()))?;
            env.insert(
                format!("BACKENDS_{port}"),
                format!("{link}.{}.{discovery_domain}", id.app),
            );
            let service = format!("SERVICE_{}", link.to_uppercase());
            env.insert(format!("{service}_ADDR"), "backends".to_string());
            env.insert(format!("{service}_PORT"), port.to_string());
        }

        Ok(Self {
            id,
            image: body.image,
            scale: body.scale.max(1),
            env,
            links: body.links,
            command: body.command,
            services: body.services,
        })
    }

    pub fn container_name(&self) -> String {
        self.id.container_name()
    }

    /// Container ports of all declared services, ascending and deduplicated.
    pub fn exposed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.services.values().map(ServiceDecl::port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Environment as `KEY=value` strings, in key order.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}
