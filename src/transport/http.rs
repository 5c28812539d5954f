//! Node RPC over HTTP
//!
//! Client side of the `/rpc/v1` routes served by [`crate::api::node_rpc`].
//! Bodies are enveloped JSON; error bodies are rebuilt into the variant the
//! node returned so callers can branch on `NotPrimary`, `StaleEpoch` and the
//! rest exactly as they do in process.

use super::NodeTransport;
use crate::api::wire::{Envelope, ErrorEnvelope};
use crate::query::{PartialQuery, PartialResult};
use crate::storage::{
    FetchLogRequest, LogChunk, NodeStatus, ReadPage, ReadRequest, RejoinOutcome, RejoinRequest,
    ReplicateAck, ReplicateRequest, Snapshot, WriteAck, WriteRecord,
};
use crate::{Error, Result, ShardGroupId};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const RPC_PREFIX: &str = "/rpc/v1";

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(addr: &str, path: &str) -> String {
        if addr.starts_with("http://") || addr.starts_with("https://") {
            format!("{}{}{}", addr.trim_end_matches('/'), RPC_PREFIX, path)
        } else {
            format!("http://{}{}{}", addr, RPC_PREFIX, path)
        }
    }

    async fn post<B, R>(&self, addr: &str, path: &str, body: B) -> Result<R>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let url = Self::url(addr, path);
        debug!(url = %url, "Node RPC");
        let response = self
            .client
            .post(&url)
            .json(&Envelope::new(body))
            .send()
            .await?;
        decode(response).await
    }

    async fn get<R: DeserializeOwned>(&self, addr: &str, path: &str) -> Result<R> {
        let url = Self::url(addr, path);
        debug!(url = %url, "Node RPC");
        let response = self.client.get(&url).send().await?;
        decode(response).await
    }
}

async fn decode<R: DeserializeOwned>(response: Response) -> Result<R> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        let envelope: Envelope<R> = serde_json::from_slice(&bytes)?;
        return envelope.into_body();
    }
    match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
        Ok(envelope) => Err(envelope.error.into()),
        Err(_) => Err(Error::Transport(format!(
            "HTTP {}: {}",
            status,
            String::from_utf8_lossy(&bytes)
        ))),
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn write(&self, addr: &str, shard: ShardGroupId, record: WriteRecord) -> Result<WriteAck> {
        self.post(addr, &format!("/shards/{}/write", shard), record)
            .await
    }

    async fn replicate(&self, addr: &str, request: ReplicateRequest) -> Result<ReplicateAck> {
        self.post(addr, "/replicate", request).await
    }

    async fn install_snapshot(&self, addr: &str, snapshot: Snapshot) -> Result<ReplicateAck> {
        self.post(addr, "/snapshot/install", snapshot).await
    }

    async fn read(&self, addr: &str, request: ReadRequest) -> Result<ReadPage> {
        self.post(addr, "/read", request).await
    }

    async fn query_partial(&self, addr: &str, request: PartialQuery) -> Result<PartialResult> {
        self.post(addr, "/query", request).await
    }

    async fn fetch_log(&self, addr: &str, request: FetchLogRequest) -> Result<LogChunk> {
        self.post(addr, "/log", request).await
    }

    async fn snapshot(&self, addr: &str, shard: ShardGroupId) -> Result<Snapshot> {
        self.get(addr, &format!("/shards/{}/snapshot", shard)).await
    }

    async fn rejoin(&self, addr: &str, request: RejoinRequest) -> Result<RejoinOutcome> {
        self.post(addr, "/rejoin", request).await
    }

    async fn status(&self, addr: &str) -> Result<NodeStatus> {
        self.get(addr, "/status").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        assert_eq!(
            HttpTransport::url("10.0.0.1:7000", "/status"),
            "http://10.0.0.1:7000/rpc/v1/status"
        );
        assert_eq!(
            HttpTransport::url("https://node-a/", "/read"),
            "https://node-a/rpc/v1/read"
        );
    }
}
