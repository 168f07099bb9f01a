//! Discovery client.
//!
//! First-time cluster formation against a public discovery service that
//! speaks the etcd v2 keys API.  The discovery URL names a directory; each
//! member registers `<dir>/<id>` with its `name=url` configuration, the
//! expected cluster size lives at `<dir>/_config/size`, and the client
//! long-polls the directory until that many members have registered.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery service returned {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("discovery service returned a malformed response: {0}")]
    BadResponse(String),

    #[error("member id {0:016x} is already registered")]
    DuplicateId(u64),

    #[error("cluster size not found in discovery service")]
    SizeNotFound,

    #[error("invalid cluster size {0:?}")]
    BadSize(String),

    #[error("cluster is full")]
    FullCluster,

    #[error("discovered cluster is invalid: {0}")]
    Cluster(#[from] ClusterError),

    #[error("discovered cluster has no member named {0:?}")]
    MissingSelf(String),
}

/// What this node announces to the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Discovery directory URL.
    pub url: String,
    pub id: u64,
    /// `name=url[,name=url...]` for this member.
    pub config: String,
}

/// Exchange this node's registration for the full initial membership.
pub trait Discovery: Send + Sync {
    fn discover<'a>(
        &'a self,
        registration: &'a Registration,
    ) -> Pin<Box<dyn Future<Output = Result<Cluster, DiscoveryError>> + Send + 'a>>;
}

/// Retry schedule for transient failures (transport errors and 5xx).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// A node in an etcd v2 keys API response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<RemoteNode>,
    #[serde(default)]
    created_index: u64,
    #[serde(default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: RemoteNode,
}

/// [`Discovery`] over HTTP.
pub struct HttpDiscovery {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpDiscovery {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn run(&self, reg: &Registration) -> Result<Cluster, DiscoveryError> {
        let base = reg.url.trim_end_matches('/');
        let self_key = format!("{:016x}", reg.id);

        self.create_self(base, &self_key, reg).await?;
        let size = self.get_size(base).await?;
        let (mut nodes, mut index) = self.get_nodes(base).await?;
        info!(registered = nodes.len(), size, "Registered with discovery service");

        check_cluster(&nodes, size, &self_key)?;
        while nodes.len() < size {
            debug!(
                registered = nodes.len(),
                size, "Waiting for peers to register"
            );
            let node = self.wait_next(base, index + 1).await?;
            index = index.max(node.modified_index);
            if is_member_key(&node.key) && !nodes.iter().any(|n| n.key == node.key) {
                nodes.push(node);
            }
        }
        nodes.truncate(size);

        let config: Vec<&str> = nodes.iter().filter_map(|n| n.value.as_deref()).collect();
        Ok(Cluster::parse(&config.join(","))?)
    }

    async fn create_self(
        &self,
        base: &str,
        self_key: &str,
        reg: &Registration,
    ) -> Result<(), DiscoveryError> {
        let url = format!("{base}/{self_key}?prevExist=false");
        let resp = self
            .send(|| {
                self.client
                    .put(&url)
                    .form(&[("value", reg.config.as_str())])
            })
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::PRECONDITION_FAILED => Err(DiscoveryError::DuplicateId(reg.id)),
            status => Err(unexpected(&url, status)),
        }
    }

    async fn get_size(&self, base: &str) -> Result<usize, DiscoveryError> {
        let url = format!("{base}/_config/size");
        let resp = self.send(|| self.client.get(&url)).await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(DiscoveryError::SizeNotFound),
            status => return Err(unexpected(&url, status)),
        }
        let value = decode(resp).await?.node.value.unwrap_or_default();
        match value.trim().parse::<usize>() {
            Ok(size) if size > 0 => Ok(size),
            _ => Err(DiscoveryError::BadSize(value)),
        }
    }

    /// Registered members ordered by creation, plus the index to watch from.
    async fn get_nodes(&self, base: &str) -> Result<(Vec<RemoteNode>, u64), DiscoveryError> {
        let url = format!("{base}?recursive=true");
        let resp = self.send(|| self.client.get(&url)).await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected(&url, resp.status()));
        }
        let header_index = resp
            .headers()
            .get("X-Etcd-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let dir = decode(resp).await?.node;
        let mut nodes: Vec<RemoteNode> = dir
            .nodes
            .into_iter()
            .filter(|n| is_member_key(&n.key))
            .collect();
        nodes.sort_by_key(|n| n.created_index);
        let index = header_index
            .or_else(|| nodes.iter().map(|n| n.modified_index).max())
            .unwrap_or(0);
        Ok((nodes, index))
    }

    async fn wait_next(&self, base: &str, wait_index: u64) -> Result<RemoteNode, DiscoveryError> {
        let url = format!("{base}?wait=true&recursive=true&waitIndex={wait_index}");
        let resp = self.send(|| self.client.get(&url)).await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected(&url, resp.status()));
        }
        Ok(decode(resp).await?.node)
    }

    /// Send with bounded exponential backoff on transport errors and 5xx.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, DiscoveryError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let err = match build().send().await {
                Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
                Ok(resp) => unexpected(resp.url().as_str(), resp.status()),
                Err(e) => DiscoveryError::Http(e),
            };
            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.base_delay * 2u32.saturating_pow(attempt);
            warn!(error = %err, attempt, ?delay, "Discovery request failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl Discovery for HttpDiscovery {
    fn discover<'a>(
        &'a self,
        registration: &'a Registration,
    ) -> Pin<Box<dyn Future<Output = Result<Cluster, DiscoveryError>> + Send + 'a>> {
        Box::pin(self.run(registration))
    }
}

/// More registrations than `size` is fine as long as we are among the
/// first `size` to have registered.
fn check_cluster(nodes: &[RemoteNode], size: usize, self_key: &str) -> Result<(), DiscoveryError> {
    if nodes.len() <= size {
        return Ok(());
    }
    let suffix = format!("/{self_key}");
    if nodes[..size].iter().any(|n| n.key.ends_with(&suffix)) {
        Ok(())
    } else {
        Err(DiscoveryError::FullCluster)
    }
}

fn is_member_key(key: &str) -> bool {
    !key.ends_with("/_config") && !key.contains("/_config/")
}

fn unexpected(url: &str, status: StatusCode) -> DiscoveryError {
    DiscoveryError::UnexpectedStatus {
        url: url.to_string(),
        status: status.as_u16(),
    }
}

async fn decode(resp: reqwest::Response) -> Result<KeysResponse, DiscoveryError> {
    resp.json::<KeysResponse>()
        .await
        .map_err(|e| DiscoveryError::BadResponse(e.to_string()))
}
