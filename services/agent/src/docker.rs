//! Docker Engine API client.
//!
//! Speaks HTTP/1.1 over the engine's unix socket. Only the handful of
//! endpoints the agent needs are covered: container lifecycle, image pull and
//! the event stream.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use url::form_urlencoded;

use crate::image::ImageRef;
use crate::runtime::{
    ContainerDetails, ContainerEvent, ContainerRuntime, ContainerSummary, CreateOptions,
    PortBinding, RemoveOptions, RuntimeError, RuntimeResult,
};

/// Docker API client for the local engine socket.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<Response<Body>> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(%method, path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };
        Ok(self.client.request(request).await?)
    }

    /// Send a request, fail on non-2xx, and return the raw body.
    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> RuntimeResult<Vec<u8>> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(body.to_vec())
        } else {
            Err(api_error(status, &body))
        }
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<T> {
        let bytes = self.call(method, path, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map a failed response to a runtime error.
fn api_error(status: StatusCode, body: &[u8]) -> RuntimeError {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    match status {
        StatusCode::NOT_FOUND => RuntimeError::NotFound(message),
        StatusCode::CONFLICT => RuntimeError::Conflict(message),
        _ => {
            error!(status = %status, message = %message, "Docker API error");
            RuntimeError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn with_query(path: &str, params: &[(&str, &str)]) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    format!("{path}?{query}")
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

type ApiPortMap = HashMap<String, Option<Vec<ApiPortBinding>>>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainerConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainerState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiNetworkSettings {
    #[serde(default)]
    ports: Option<ApiPortMap>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiInspectHostConfig {
    #[serde(default)]
    port_bindings: Option<ApiPortMap>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainerInspect {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: ApiContainerConfig,
    #[serde(default)]
    state: ApiContainerState,
    #[serde(default)]
    network_settings: ApiNetworkSettings,
    #[serde(default)]
    host_config: ApiInspectHostConfig,
}

fn convert_ports(ports: ApiPortMap) -> BTreeMap<String, Vec<PortBinding>> {
    ports
        .into_iter()
        .filter_map(|(port, bindings)| {
            let bindings: Vec<PortBinding> = bindings?
                .into_iter()
                .filter(|b| !b.host_port.is_empty())
                .map(|b| PortBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (!bindings.is_empty()).then_some((port, bindings))
        })
        .collect()
}

impl From<ApiContainerInspect> for ContainerDetails {
    fn from(c: ApiContainerInspect) -> Self {
        // Published ports live in NetworkSettings once running; HostConfig
        // only carries explicitly requested bindings.
        let mut ports = convert_ports(c.network_settings.ports.unwrap_or_default());
        if ports.is_empty() {
            ports = convert_ports(c.host_config.port_bindings.unwrap_or_default());
        }
        ContainerDetails {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            image: c.config.image,
            env: c.config.env.unwrap_or_default(),
            running: c.state.running,
            ports,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiHostConfig {
    publish_all_ports: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    links: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiCreateBody {
    image: String,
    env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<Vec<String>>,
    exposed_ports: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    host_config: ApiHostConfig,
}

impl From<&CreateOptions> for ApiCreateBody {
    fn from(opts: &CreateOptions) -> Self {
        Self {
            image: opts.image.clone(),
            env: opts.env.clone(),
            cmd: (!opts.command.is_empty()).then(|| opts.command.clone()),
            exposed_ports: opts
                .exposed_ports
                .iter()
                .map(|p| (format!("{p}/tcp"), serde_json::Map::new()))
                .collect(),
            host_config: ApiHostConfig {
                publish_all_ports: opts.publish_all_ports,
                links: opts.links.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiCreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiWaitResponse {
    status_code: i64,
}

/// One line of the `/images/create` progress stream.
#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

/// First error reported inside a pull progress stream.
fn pull_stream_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| serde_json::from_str::<PullProgress>(line).ok())
        .find_map(|p| p.error)
}

#[derive(Debug, Default, Deserialize)]
struct ApiEventActor {
    #[serde(rename = "ID", default)]
    id: String,
}

/// One line of the `/events` stream. Older engines only send `status`/`id`,
/// newer ones add `Type`/`Action`/`Actor`.
#[derive(Debug, Deserialize)]
struct ApiEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: ApiEventActor,
}

fn parse_event(line: &str) -> Option<ContainerEvent> {
    let event: ApiEvent = serde_json::from_str(line).ok()?;
    if event.kind.as_deref().is_some_and(|k| k != "container") {
        return None;
    }
    let status = event.status.or(event.action)?;
    let id = event.id.unwrap_or(event.actor.id);
    if id.is_empty() {
        return None;
    }
    Some(ContainerEvent { id, status })
}

/// Forward newline-delimited events from a streaming body until either side
/// goes away.
async fn pump_events(mut body: Body, tx: mpsc::Sender<ContainerEvent>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            chunk = body.data() => chunk,
            _ = tx.closed() => break,
        };
        match chunk {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_event(line) {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        None => debug!(line, "Ignoring Docker event"),
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Docker event stream failed");
                break;
            }
            None => break,
        }
    }
    debug!("Docker event stream closed");
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
        let path = with_query("/containers/json", &[("all", if all { "1" } else { "0" })]);
        let list: Vec<ApiContainerSummary> = self.call_json(Method::GET, &path, None).await?;
        Ok(list
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                names: c
                    .names
                    .iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image,
                running: c.state == "running",
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let inspect: ApiContainerInspect = self
            .call_json(Method::GET, &format!("/containers/{id}/json"), None)
            .await?;
        Ok(inspect.into())
    }

    async fn create_container(&self, opts: &CreateOptions) -> RuntimeResult<String> {
        let path = with_query("/containers/create", &[("name", opts.name.as_str())]);
        let body = serde_json::to_vec(&ApiCreateBody::from(opts))?;
        let created: ApiCreateResponse = self.call_json(Method::POST, &path, Some(body)).await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.call(Method::POST, &format!("/containers/{id}/start"), None)
            .await
            .map(drop)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let secs = grace.as_secs().to_string();
        let path = with_query(&format!("/containers/{id}/stop"), &[("t", secs.as_str())]);
        self.call(Method::POST, &path, None).await.map(drop)
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        let waited: ApiWaitResponse = self
            .call_json(Method::POST, &format!("/containers/{id}/wait"), None)
            .await?;
        Ok(waited.status_code)
    }

    async fn remove_container(&self, id: &str, opts: RemoveOptions) -> RuntimeResult<()> {
        let flag = |b: bool| if b { "1" } else { "0" };
        let path = with_query(
            &format!("/containers/{id}"),
            &[("v", flag(opts.remove_volumes)), ("force", flag(opts.force))],
        );
        self.call(Method::DELETE, &path, None).await.map(drop)
    }

    async fn pull_image(&self, image: &ImageRef) -> RuntimeResult<()> {
        let path = if image.is_digest() {
            with_query("/images/create", &[("fromImage", image.to_string().as_str())])
        } else {
            with_query(
                "/images/create",
                &[("fromImage", image.repository.as_str()), ("tag", image.tag.as_str())],
            )
        };
        let body = self.call(Method::POST, &path, None).await.map_err(|e| match e {
            RuntimeError::NotFound(message) | RuntimeError::Api { message, .. } => {
                RuntimeError::Pull {
                    image: image.to_string(),
                    message,
                }
            }
            other => other,
        })?;
        // The engine answers 200 and reports failures inside the progress stream.
        match pull_stream_error(&body) {
            Some(message) => Err(RuntimeError::Pull {
                image: image.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>> {
        let filters = r#"{"type":["container"]}"#;
        let path = with_query("/events", &[("filters", filters)]);
        let response = self.send(Method::GET, &path, None).await?;
        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            return Err(api_error(status, &body));
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump_events(response.into_body(), tx));
        Ok(rx)
    }
}
