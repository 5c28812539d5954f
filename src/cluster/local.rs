//! An N x M cluster in one process
//!
//! Boots the coordination ensemble, the cluster map, every storage node, the
//! router, the ingestion gateway and the query coordinator over an
//! in-process transport. Integration tests drive it with a [`ManualClock`]
//! and its fault-injection hooks; the server binary runs it on the system
//! clock with background tickers, optionally wiring the nodes to each other
//! over HTTP.

use super::admin::{AddrResolver, ClusterAdmin};
use super::coordination::{
    bootstrap_cluster, primary_resource, CoordinationClient, LocalCoordinationClient,
};
use super::ensemble::Ensemble;
use super::map::ClusterMap;
use crate::clock::{Clock, ManualClock};
use crate::config::ClusterConfig;
use crate::ingest::IngestionGateway;
use crate::query::QueryCoordinator;
use crate::router::Router;
use crate::storage::node::{NodeOptions, StorageNode};
use crate::transport::{LocalNetwork, LocalTransport, NodeTransport};
use crate::{Error, NodeId, Result, ShardGroupId};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How nodes and the router reach each other
#[derive(Clone, Default)]
pub enum Wiring {
    /// [`LocalTransport`] with fault injection; addresses are node ids
    #[default]
    InProcess,
    /// Every call goes through `transport`; a node's address is
    /// `{advertise}/nodes/{node_id}`
    Http {
        advertise: String,
        transport: Arc<dyn NodeTransport>,
    },
}

impl Wiring {
    fn addr_resolver(&self) -> AddrResolver {
        match self {
            Wiring::InProcess => Arc::new(|node_id: &str| node_id.to_string()) as AddrResolver,
            Wiring::Http { advertise, .. } => {
                let base = advertise.trim_end_matches('/').to_string();
                Arc::new(move |node_id: &str| format!("{}/nodes/{}", base, node_id)) as AddrResolver
            }
        }
    }
}

pub struct LocalCluster {
    config: ClusterConfig,
    wiring: Wiring,
    clock: Arc<dyn Clock>,
    manual_clock: Option<Arc<ManualClock>>,
    ensemble: Arc<Ensemble>,
    client: Arc<dyn CoordinationClient>,
    network: Arc<LocalNetwork>,
    object_store: Arc<dyn ObjectStore>,
    /// Each node's own connection to the ensemble
    node_clients: RwLock<BTreeMap<NodeId, Arc<LocalCoordinationClient>>>,
    nodes: RwLock<BTreeMap<NodeId, Arc<StorageNode>>>,
    router: Arc<Router>,
    gateway: Arc<IngestionGateway>,
    coordinator: Arc<QueryCoordinator>,
    admin: Arc<ClusterAdmin>,
}

impl LocalCluster {
    /// Start on a [`ManualClock`] with in-memory segment storage
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        let clock = Arc::new(ManualClock::default());
        Self::build(
            config,
            clock.clone(),
            Some(clock),
            Arc::new(InMemory::new()),
            Wiring::InProcess,
        )
        .await
    }

    /// Start on an arbitrary clock, segment store and wiring
    pub async fn start_with(
        config: ClusterConfig,
        clock: Arc<dyn Clock>,
        object_store: Arc<dyn ObjectStore>,
        wiring: Wiring,
    ) -> Result<Self> {
        Self::build(config, clock, None, object_store, wiring).await
    }

    async fn build(
        config: ClusterConfig,
        clock: Arc<dyn Clock>,
        manual_clock: Option<Arc<ManualClock>>,
        object_store: Arc<dyn ObjectStore>,
        wiring: Wiring,
    ) -> Result<Self> {
        config.validate()?;
        let ensemble = Arc::new(Ensemble::new(config.ensemble_size, clock.clone()));
        let client: Arc<dyn CoordinationClient> =
            Arc::new(LocalCoordinationClient::new(ensemble.clone()));
        let addr_for = wiring.addr_resolver();
        let map = ClusterMap::bootstrap(
            config.shard_groups,
            config.replicas_per_group,
            config.partition,
            |node_id| addr_for(node_id),
        );
        bootstrap_cluster(client.as_ref(), &map, clock.now_ms()).await?;

        let network = LocalNetwork::new();
        let transport: Arc<dyn NodeTransport> = match &wiring {
            Wiring::InProcess => Arc::new(LocalTransport::client(network.clone())),
            Wiring::Http { transport, .. } => transport.clone(),
        };
        let router = Arc::new(
            Router::connect(client.clone(), transport.clone(), config.router.clone()).await?,
        );
        let gateway = Arc::new(IngestionGateway::new(router.clone(), config.ingest.clone()));
        let coordinator = Arc::new(QueryCoordinator::new(router.clone(), config.query.clone()));
        let admin = Arc::new(ClusterAdmin::new(
            client.clone(),
            clock.clone(),
            transport,
            config.replicas_per_group,
            addr_for,
        ));

        let cluster = Self {
            config,
            wiring,
            clock,
            manual_clock,
            ensemble,
            client,
            network,
            object_store,
            node_clients: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            router,
            gateway,
            coordinator,
            admin,
        };
        for (shard, node_id) in node_placements(&map) {
            cluster.open_node(shard, &node_id).await?;
        }
        cluster.tick().await;
        info!(
            shard_groups = cluster.config.shard_groups,
            replicas_per_group = cluster.config.replicas_per_group,
            "Local cluster started"
        );
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ensemble(&self) -> &Arc<Ensemble> {
        &self.ensemble
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    pub fn coordinator(&self) -> &Arc<QueryCoordinator> {
        &self.coordinator
    }

    pub fn admin(&self) -> &Arc<ClusterAdmin> {
        &self.admin
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<StorageNode>> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Running nodes in id order
    pub fn nodes(&self) -> Vec<Arc<StorageNode>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Holder of the group's live primary lease
    pub async fn primary_of(&self, shard: ShardGroupId) -> Result<Option<NodeId>> {
        Ok(self
            .client
            .lease_holder(&primary_resource(shard))
            .await?
            .map(|record| record.holder))
    }

    /// Kill a node: it stops answering and loses everything not on disk or
    /// in object storage. Its lease runs out on its own.
    pub fn crash_node(&self, node_id: &str) -> Result<()> {
        let removed = self.nodes.write().remove(node_id);
        if removed.is_none() {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        self.network.unregister(node_id);
        self.node_clients.write().remove(node_id);
        warn!(node = %node_id, "Node crashed");
        Ok(())
    }

    /// Bring a crashed node back from its WAL and manifest
    pub async fn restart_node(&self, node_id: &str) -> Result<Arc<StorageNode>> {
        if self.nodes.read().contains_key(node_id) {
            return Err(Error::InvalidRequest(format!("{} is already running", node_id)));
        }
        let map = self.router.refresh().await?;
        let shard = map
            .locate(node_id)
            .map(|(group, _)| group.id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        let node = self.open_node(shard, node_id).await?;
        info!(node = %node_id, shard, "Node restarted");
        Ok(node)
    }

    /// Cut a node off from its peers and from the ensemble, or reconnect it
    pub fn isolate_node(&self, node_id: &str, isolated: bool) -> Result<()> {
        let client = self
            .node_clients
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        client.set_connected(!isolated);
        self.network.set_reachable(node_id, !isolated);
        info!(node = %node_id, isolated, "Node isolation changed");
        Ok(())
    }

    pub fn set_ensemble_member_reachable(&self, idx: usize, reachable: bool) {
        self.ensemble.set_member_reachable(idx, reachable);
    }

    /// Move the manual clock forward; fails on a system-clock cluster
    pub fn advance_clock(&self, by: Duration) -> Result<()> {
        match &self.manual_clock {
            Some(clock) => {
                clock.advance(by);
                Ok(())
            }
            None => Err(Error::Config("cluster runs on the system clock".into())),
        }
    }

    /// One maintenance round on every running node, then a router refresh.
    /// Errors are logged; a failing node does not stop the round.
    pub async fn tick(&self) {
        for node in self.nodes() {
            if let Err(e) = node.tick().await {
                debug!(node = %node.node_id(), error = %e, "Tick failed");
            }
        }
        if let Err(e) = self.router.refresh().await {
            debug!(error = %e, "Router refresh failed");
        }
    }

    /// Advance the clock past the lease TTL and tick until every group has
    /// a primary again, or `rounds` run out
    pub async fn fail_over(&self, rounds: usize) -> Result<()> {
        self.advance_clock(self.config.lease_ttl + Duration::from_millis(1))?;
        for _ in 0..rounds.max(1) {
            self.tick().await;
            let mut all_led = true;
            for shard in self.router.map().group_ids() {
                if self.primary_of(shard).await?.is_none() {
                    all_led = false;
                }
            }
            if all_led {
                return Ok(());
            }
        }
        Err(Error::unavailable("some shard group has no primary"))
    }

    /// Register a shard group and start its replicas
    pub async fn add_shard_group(&self) -> Result<ShardGroupId> {
        let (map, shard) = self.admin.add_shard_group().await?;
        for (group, node_id) in node_placements(&map) {
            if group == shard {
                self.open_node(shard, &node_id).await?;
            }
        }
        self.tick().await;
        Ok(shard)
    }

    /// Drop a shard group that owns no hash ranges and stop its replicas
    pub async fn remove_shard_group(&self, shard: ShardGroupId) -> Result<()> {
        let before = self.router.refresh().await?;
        self.admin.remove_shard_group(shard).await?;
        if let Some(group) = before.group(shard) {
            for replica in &group.replicas {
                if self.nodes.read().contains_key(&replica.node_id) {
                    self.crash_node(&replica.node_id)?;
                }
            }
        }
        self.router.refresh().await?;
        Ok(())
    }

    /// Per-node tickers at the lease renew interval plus the router's map
    /// watcher; all stop when `cancel` fires
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.router.clone().spawn_map_watcher(cancel.clone())];
        let interval = self.config.lease_renew_interval;
        let cluster = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for node in cluster.nodes() {
                            if let Err(e) = node.tick().await {
                                debug!(node = %node.node_id(), error = %e, "Background tick failed");
                            }
                        }
                    }
                }
            }
        }));
        let cluster = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval * 10);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match cluster.ensemble.scavenge_leases() {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "Expired leases scavenged"),
                            Err(e) => debug!(error = %e, "Lease scavenge failed"),
                        }
                    }
                }
            }
        }));
        handles
    }

    async fn open_node(&self, shard: ShardGroupId, node_id: &str) -> Result<Arc<StorageNode>> {
        let client = Arc::new(LocalCoordinationClient::new(self.ensemble.clone()));
        let node = StorageNode::open(NodeOptions {
            node_id: node_id.to_string(),
            shard,
            config: self.config.clone(),
            coordination: client.clone(),
            transport: match &self.wiring {
                Wiring::InProcess => {
                    Arc::new(LocalTransport::for_node(self.network.clone(), node_id))
                        as Arc<dyn NodeTransport>
                }
                Wiring::Http { transport, .. } => transport.clone(),
            },
            object_store: self.object_store.clone(),
            clock: self.clock.clone(),
        })
        .await?;
        self.network.register(node.clone());
        self.node_clients.write().insert(node_id.to_string(), client);
        self.nodes.write().insert(node_id.to_string(), node.clone());
        Ok(node)
    }
}

fn node_placements(map: &ClusterMap) -> Vec<(ShardGroupId, NodeId)> {
    map.groups
        .iter()
        .flat_map(|g| g.replicas.iter().map(move |r| (g.id, r.node_id.clone())))
        .collect()
}
