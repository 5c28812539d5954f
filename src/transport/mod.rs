//! Node RPC contract and its transports
//!
//! Routers, coordinators and peer replicas talk to storage nodes only
//! through [`NodeTransport`]. `addr` is the replica address recorded in the
//! cluster map: the node id for [`LocalTransport`], `host:port` for
//! [`HttpTransport`].

pub mod http;
pub mod local;

pub use http::HttpTransport;
pub use local::{LocalNetwork, LocalTransport};

use crate::query::{PartialQuery, PartialResult};
use crate::storage::{
    FetchLogRequest, LogChunk, NodeStatus, ReadPage, ReadRequest, RejoinOutcome, RejoinRequest,
    ReplicateAck, ReplicateRequest, Snapshot, WriteAck, WriteRecord,
};
use crate::{Result, ShardGroupId};
use async_trait::async_trait;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Write a record through the shard group's primary
    async fn write(&self, addr: &str, shard: ShardGroupId, record: WriteRecord) -> Result<WriteAck>;

    /// Ship log entries (or a heartbeat) to a secondary
    async fn replicate(&self, addr: &str, request: ReplicateRequest) -> Result<ReplicateAck>;

    /// Replace a secondary's state with a snapshot of the primary's
    async fn install_snapshot(&self, addr: &str, snapshot: Snapshot) -> Result<ReplicateAck>;

    async fn read(&self, addr: &str, request: ReadRequest) -> Result<ReadPage>;

    /// Evaluate a query against one replica and return its partial result
    async fn query_partial(&self, addr: &str, request: PartialQuery) -> Result<PartialResult>;

    async fn fetch_log(&self, addr: &str, request: FetchLogRequest) -> Result<LogChunk>;

    async fn snapshot(&self, addr: &str, shard: ShardGroupId) -> Result<Snapshot>;

    /// Ask the primary at `addr` to bring a returning replica up to date
    async fn rejoin(&self, addr: &str, request: RejoinRequest) -> Result<RejoinOutcome>;

    async fn status(&self, addr: &str) -> Result<NodeStatus>;
}
