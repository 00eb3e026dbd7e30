//! Typed access to the device bridge's REST API.

use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dashboard_common::{Node, NodeDetail, NodeList, ParamValue, ParamWrite, Parameter};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The caller gave up on the request. Not a failure the operator should see.
    #[error("request cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Operations the node session needs from the backend.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn list_nodes(&self, cancel: Option<&CancellationToken>)
        -> Result<Vec<Node>, ClientError>;

    async fn get_node_detail(
        &self,
        node_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<NodeDetail, ClientError>;

    async fn get_parameters(
        &self,
        node_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Parameter>, ClientError>;

    async fn get_parameter(
        &self,
        node_id: u32,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Parameter, ClientError>;

    /// Returns the value the device settled on, which may differ from `value`.
    async fn set_parameter(
        &self,
        node_id: u32,
        name: &str,
        value: &ParamValue,
    ) -> Result<Parameter, ClientError>;
}

#[derive(Clone)]
pub struct ParamClient {
    base_url: String,
    http: reqwest::Client,
}

impl ParamClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_http(base_url, reqwest::Client::new())
    }

    pub fn with_http(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        let request = async {
            let response = self.http.get(&url).send().await?.error_for_status()?;
            Ok::<T, ClientError>(response.json::<T>().await?)
        };
        cancellable(cancel, request).await.inspect_err(|err| {
            if err.is_cancelled() {
                debug!(%url, "request cancelled");
            }
        })
    }
}

/// Races `request` against `cancel`. A token that is already cancelled wins
/// without the request being polled.
async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    request: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(ClientError::Cancelled),
                result = request => result,
            }
        }
        None => request.await,
    }
}

fn param_path(node_id: u32, name: &str) -> String {
    format!("/api/nodes/{node_id}/params/{name}")
}

pub fn sort_nodes(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by_key(|node| node.id);
    nodes
}

#[async_trait]
impl NodeApi for ParamClient {
    async fn list_nodes(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Node>, ClientError> {
        let list: NodeList = self.get_json("/api/nodes", cancel).await?;
        Ok(sort_nodes(list.nodes))
    }

    async fn get_node_detail(
        &self,
        node_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<NodeDetail, ClientError> {
        self.get_json(&format!("/api/nodes/{node_id}"), cancel).await
    }

    async fn get_parameters(
        &self,
        node_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Parameter>, ClientError> {
        self.get_json(&format!("/api/nodes/{node_id}/params"), cancel)
            .await
    }

    async fn get_parameter(
        &self,
        node_id: u32,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Parameter, ClientError> {
        self.get_json(&param_path(node_id, name), cancel).await
    }

    async fn set_parameter(
        &self,
        node_id: u32,
        name: &str,
        value: &ParamValue,
    ) -> Result<Parameter, ClientError> {
        let url = self.url(&param_path(node_id, name));
        let response = self
            .http
            .post(&url)
            .json(&ParamWrite::new(value))
            .send()
            .await?
            .error_for_status()?;
        let confirmed: Parameter = response.json().await?;

        if confirmed.value.is_empty() {
            return Err(ClientError::InvalidResponse(format!(
                "device returned no value for {name}"
            )));
        }
        Ok(confirmed)
    }
}
