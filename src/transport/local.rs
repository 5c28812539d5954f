//! In-process transport with fault injection
//!
//! All nodes of a [`LocalCluster`](crate::cluster::LocalCluster) share one
//! [`LocalNetwork`]. Each caller holds a [`LocalTransport`] bound to its own
//! identity, so isolating a node cuts both the calls it receives and the
//! calls it makes.

use super::NodeTransport;
use crate::query::{PartialQuery, PartialResult};
use crate::storage::{
    FetchLogRequest, LogChunk, NodeStatus, ReadPage, ReadRequest, RejoinOutcome, RejoinRequest,
    ReplicateAck, ReplicateRequest, Snapshot, StorageNode, WriteAck, WriteRecord,
};
use crate::{Error, NodeId, Result, ShardGroupId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::debug;

/// Registry of running nodes plus the set of unreachable ones
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeId, Arc<StorageNode>>,
    down: DashSet<NodeId>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: Arc<StorageNode>) {
        let id = node.node_id().to_string();
        self.down.remove(&id);
        self.nodes.insert(id, node);
    }

    /// Forget a node, as if its process died
    pub fn unregister(&self, node_id: &str) -> Option<Arc<StorageNode>> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    pub fn set_reachable(&self, node_id: &str, reachable: bool) {
        if reachable {
            self.down.remove(node_id);
        } else {
            self.down.insert(node_id.to_string());
        }
        debug!(node = %node_id, reachable, "Node reachability changed");
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        !self.down.contains(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<StorageNode>> {
        self.nodes.get(node_id).map(|n| Arc::clone(n.value()))
    }

    pub fn nodes(&self) -> Vec<Arc<StorageNode>> {
        self.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }
}

/// Handle on the local network for one caller
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    caller: Option<NodeId>,
}

impl LocalTransport {
    /// Transport for routers and other clients outside the storage tier
    pub fn client(network: Arc<LocalNetwork>) -> Self {
        Self {
            network,
            caller: None,
        }
    }

    /// Transport used by a storage node to reach its peers
    pub fn for_node(network: Arc<LocalNetwork>, node_id: impl Into<NodeId>) -> Self {
        Self {
            network,
            caller: Some(node_id.into()),
        }
    }

    fn target(&self, addr: &str) -> Result<Arc<StorageNode>> {
        if let Some(caller) = &self.caller {
            if !self.network.is_reachable(caller) {
                return Err(Error::Transport(format!("{} is isolated", caller)));
            }
        }
        if !self.network.is_reachable(addr) {
            return Err(Error::Transport(format!("{} is unreachable", addr)));
        }
        self.network
            .node(addr)
            .ok_or_else(|| Error::Transport(format!("no node listening at {}", addr)))
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn write(&self, addr: &str, shard: ShardGroupId, record: WriteRecord) -> Result<WriteAck> {
        self.target(addr)?.write(shard, record).await
    }

    async fn replicate(&self, addr: &str, request: ReplicateRequest) -> Result<ReplicateAck> {
        self.target(addr)?.replicate(request).await
    }

    async fn install_snapshot(&self, addr: &str, snapshot: Snapshot) -> Result<ReplicateAck> {
        self.target(addr)?.install_snapshot(snapshot).await
    }

    async fn read(&self, addr: &str, request: ReadRequest) -> Result<ReadPage> {
        self.target(addr)?.read(request).await
    }

    async fn query_partial(&self, addr: &str, request: PartialQuery) -> Result<PartialResult> {
        self.target(addr)?.query_partial(request).await
    }

    async fn fetch_log(&self, addr: &str, request: FetchLogRequest) -> Result<LogChunk> {
        self.target(addr)?.fetch_log(request).await
    }

    async fn snapshot(&self, addr: &str, shard: ShardGroupId) -> Result<Snapshot> {
        self.target(addr)?.snapshot(shard).await
    }

    async fn rejoin(&self, addr: &str, request: RejoinRequest) -> Result<RejoinOutcome> {
        self.target(addr)?.handle_rejoin(request).await
    }

    async fn status(&self, addr: &str) -> Result<NodeStatus> {
        Ok(self.target(addr)?.status())
    }
}
