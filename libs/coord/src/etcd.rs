//! etcd v2 key API client.
//!
//! Talks plain HTTP to `/v2/keys`. Regular requests carry a timeout; watch
//! long-polls use a separate client without one, since etcd may hold a watch
//! open for minutes before answering.
//!
//! Reference: https://etcd.io/docs/v2.3/api/

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};
use crate::store::{KvStore, Node, Precondition, WatchEvent};

/// Error body returned by etcd on failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

/// HTTP client for an etcd v2 endpoint.
pub struct EtcdClient {
    client: Client,
    watch_client: Client,
    base_url: String,
}

impl EtcdClient {
    /// Create a client for the given endpoint, e.g. `http://127.0.0.1:4001`.
    pub fn new(base_url: impl Into<String>) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let watch_client = Client::builder().build()?;
        Ok(Self {
            client,
            watch_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// The endpoint this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!("{}/v2/keys/{}", self.base_url, key)
    }

    fn request(&self, method: Method, key: &str) -> RequestBuilder {
        self.client.request(method, self.url(key))
    }

    /// Send a request and decode either a node-bearing response or an etcd error.
    async fn send(&self, request: RequestBuilder) -> StoreResult<WatchEvent> {
        let response = request.send().await?;
        decode(response).await
    }
}

async fn decode(response: Response) -> StoreResult<WatchEvent> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Err(StoreError::Disconnected("empty response body".to_string()));
        }
        return Ok(serde_json::from_str(&body)?);
    }

    match serde_json::from_str::<EtcdErrorBody>(&body) {
        Ok(err) => {
            debug!(code = err.error_code, message = %err.message, cause = %err.cause, "etcd error");
            Err(StoreError::from_etcd(err.error_code, err.message, err.cause))
        }
        Err(_) => {
            error!(status = %status, body = %body, "unexpected etcd response");
            Err(StoreError::Api {
                code: u32::from(status.as_u16()),
                message: body,
            })
        }
    }
}

fn precondition_query(prev: &Precondition) -> (&'static str, String) {
    match prev {
        Precondition::PrevValue(v) => ("prevValue", v.clone()),
        Precondition::PrevIndex(i) => ("prevIndex", i.to_string()),
    }
}

#[async_trait]
impl KvStore for EtcdClient {
    async fn get(&self, key: &str, sorted: bool, recursive: bool) -> StoreResult<Node> {
        let request = self.request(Method::GET, key).query(&[
            ("sorted", sorted.to_string()),
            ("recursive", recursive.to_string()),
        ]);
        Ok(self.send(request).await?.node)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<Node> {
        let request = self.request(Method::PUT, key).form(&[("value", value)]);
        Ok(self.send(request).await?.node)
    }

    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<Node> {
        let mut request = self.request(Method::DELETE, key);
        if recursive {
            request = request.query(&[("recursive", "true"), ("dir", "true")]);
        }
        Ok(self.send(request).await?.node)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev: Precondition,
    ) -> StoreResult<Node> {
        let (name, expected) = precondition_query(&prev);
        let request = self
            .request(Method::PUT, key)
            .query(&[(name, expected)])
            .form(&[("value", value)]);
        Ok(self.send(request).await?.node)
    }

    async fn compare_and_delete(&self, key: &str, prev: Precondition) -> StoreResult<Node> {
        let (name, expected) = precondition_query(&prev);
        let request = self.request(Method::DELETE, key).query(&[(name, expected)]);
        Ok(self.send(request).await?.node)
    }

    async fn create_in_order(&self, dir: &str, value: &str) -> StoreResult<Node> {
        let request = self.request(Method::POST, dir).form(&[("value", value)]);
        Ok(self.send(request).await?.node)
    }

    async fn watch(
        &self,
        prefix: &str,
        wait_index: Option<u64>,
        recursive: bool,
    ) -> StoreResult<WatchEvent> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", recursive.to_string()),
        ];
        if let Some(index) = wait_index {
            query.push(("waitIndex", index.to_string()));
        }
        let request = self.watch_client.get(self.url(prefix)).query(&query);
        self.send(request).await
    }
}
