//! Shard Router
//!
//! Maps shard keys to groups with a cached [`ClusterMap`] and dispatches
//! operations to the right replica. The cache is only ever replaced
//! wholesale: on a watch event, on an explicit [`Router::refresh`], or when a
//! node answers `NotPrimary` / `RoutingMismatch`, which earn one refresh and
//! one retry. Transient failures retry with bounded exponential backoff.

use crate::cluster::coordination::{load_cluster_map, CoordinationClient, CLUSTER_MAP_KEY};
use crate::cluster::map::{ClusterMap, ShardGroup};
use crate::cluster::WatchEvent;
use crate::query::{PartialQuery, PartialResult};
use crate::storage::{ReadPage, ReadRequest, WriteAck, WriteRecord};
use crate::transport::NodeTransport;
use crate::{Error, NodeId, Result, ShardGroupId};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry policy for dispatched operations
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Retries after a transient failure, not counting the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RouterConfig {
    /// Backoff before retry number `attempt` (starting at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct Router {
    client: Arc<dyn CoordinationClient>,
    transport: Arc<dyn NodeTransport>,
    map: RwLock<Arc<ClusterMap>>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        transport: Arc<dyn NodeTransport>,
        map: ClusterMap,
        config: RouterConfig,
    ) -> Self {
        Self {
            client,
            transport,
            map: RwLock::new(Arc::new(map)),
            config,
        }
    }

    /// Create a router seeded with the ensemble's current map
    pub async fn connect(
        client: Arc<dyn CoordinationClient>,
        transport: Arc<dyn NodeTransport>,
        config: RouterConfig,
    ) -> Result<Self> {
        let (map, stale) = load_cluster_map(client.as_ref()).await?;
        if stale {
            warn!(version = map.version, "Router starting from a stale cluster map");
        }
        Ok(Self::new(client, transport, map, config))
    }

    /// Current cached map
    pub fn map(&self) -> Arc<ClusterMap> {
        Arc::clone(&self.map.read())
    }

    pub fn map_version(&self) -> u64 {
        self.map.read().version
    }

    /// Shard group that owns `key` under the cached map
    pub fn route(&self, key: &str) -> Result<ShardGroupId> {
        self.map.read().route(key)
    }

    pub fn group(&self, id: ShardGroupId) -> Result<ShardGroup> {
        self.map
            .read()
            .group(id)
            .cloned()
            .ok_or(Error::ShardNotFound(id))
    }

    /// Reload the map from the ensemble; never moves to an older version
    pub async fn refresh(&self) -> Result<Arc<ClusterMap>> {
        let (map, stale) = load_cluster_map(self.client.as_ref()).await?;
        if stale {
            debug!(version = map.version, "Refreshed from a stale ensemble view");
        }
        Ok(self.install(map))
    }

    fn install(&self, map: ClusterMap) -> Arc<ClusterMap> {
        let mut cached = self.map.write();
        if map.version > cached.version {
            debug!(from = cached.version, to = map.version, "Cluster map replaced");
            *cached = Arc::new(map);
        }
        Arc::clone(&cached)
    }

    /// Write a record through the group's primary
    pub async fn dispatch_write(&self, group: ShardGroupId, record: WriteRecord) -> Result<WriteAck> {
        self.with_retries("write", group, |map, hint| {
            let record = WriteRecord {
                map_version: map.version,
                ..record.clone()
            };
            async move {
                let addr = primary_addr(&map, group, hint.as_deref())?;
                self.transport.write(&addr, group, record).await
            }
        })
        .await
    }

    /// Read from the primary, falling back to secondaries when the request
    /// tolerates stale rows and the primary cannot serve
    pub async fn dispatch_read(&self, group: ShardGroupId, request: ReadRequest) -> Result<ReadPage> {
        let allow_stale = request.allow_stale;
        let primary = self
            .with_retries("read", group, |map, hint| {
                let request = ReadRequest {
                    allow_stale: false,
                    ..request.clone()
                };
                async move {
                    let addr = primary_addr(&map, group, hint.as_deref())?;
                    self.transport.read(&addr, request).await
                }
            })
            .await;
        match primary {
            Err(e) if allow_stale && can_fall_back(&e) => {
                self.on_secondaries(group, e, |addr| {
                    let request = ReadRequest {
                        allow_stale: true,
                        ..request.clone()
                    };
                    async move { self.transport.read(&addr, request).await }
                })
                .await
            }
            other => other,
        }
    }

    /// Run a partial query on the group, with the same fallback as reads
    pub async fn dispatch_partial_query(
        &self,
        group: ShardGroupId,
        query: PartialQuery,
    ) -> Result<PartialResult> {
        let allow_stale = query.allow_stale;
        let primary = self
            .with_retries("query", group, |map, hint| {
                let query = PartialQuery {
                    allow_stale: false,
                    ..query.clone()
                };
                async move {
                    let addr = primary_addr(&map, group, hint.as_deref())?;
                    self.transport.query_partial(&addr, query).await
                }
            })
            .await;
        match primary {
            Err(e) if allow_stale && can_fall_back(&e) => {
                self.on_secondaries(group, e, |addr| {
                    let query = PartialQuery {
                        allow_stale: true,
                        ..query.clone()
                    };
                    async move { self.transport.query_partial(&addr, query).await }
                })
                .await
            }
            other => other,
        }
    }

    /// Keep the cached map current from ensemble watch events until cancelled
    pub fn spawn_map_watcher(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut attempt = 0;
            while !cancel.is_cancelled() {
                let mut stream = match self.client.watch(CLUSTER_MAP_KEY, 0).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        attempt += 1;
                        debug!(error = %e, "Cluster map watch unavailable");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.config.backoff(attempt)) => continue,
                        }
                    }
                };
                attempt = 0;
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        Some(WatchEvent::Put { key, value, .. }) if key == CLUSTER_MAP_KEY => {
                            match serde_json::from_slice::<ClusterMap>(&value) {
                                Ok(map) => {
                                    self.install(map);
                                }
                                Err(e) => warn!(error = %e, "Undecodable cluster map in watch"),
                            }
                        }
                        Some(WatchEvent::Resync { .. }) => {
                            if let Err(e) = self.refresh().await {
                                debug!(error = %e, "Resync refresh failed");
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            info!("Cluster map watcher stopped");
        })
    }

    /// Run `call` until it succeeds, refreshing once on stale routing and
    /// backing off on transient failures. `call` receives the map to route
    /// with and the primary named by the last `NotPrimary`, if any.
    async fn with_retries<T, F, Fut>(&self, op: &'static str, group: ShardGroupId, mut call: F) -> Result<T>
    where
        F: FnMut(Arc<ClusterMap>, Option<NodeId>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        let mut refreshed = false;
        let mut hint = None;
        loop {
            let error = match call(self.map(), hint.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if error.needs_refresh() && !refreshed {
                refreshed = true;
                if let Error::NotPrimary { primary_hint, .. } = &error {
                    hint = primary_hint.clone();
                }
                debug!(op, group, error = %error, "Stale routing, refreshing cluster map");
                self.refresh().await?;
                continue;
            }
            if error.is_transient() && retries < self.config.max_retries {
                retries += 1;
                let backoff = self.config.backoff(retries);
                debug!(
                    op,
                    group,
                    retry = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(backoff).await;
                // The primary may have moved while we waited.
                hint = None;
                if let Err(e) = self.refresh().await {
                    debug!(op, error = %e, "Cluster map refresh failed");
                }
                continue;
            }
            return Err(error);
        }
    }

    async fn on_secondaries<T, F, Fut>(&self, group: ShardGroupId, primary_error: Error, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let map = self.map();
        let Some(descriptor) = map.group(group) else {
            return Err(Error::ShardNotFound(group));
        };
        let addrs: Vec<String> = descriptor
            .replicas
            .iter()
            .filter(|r| descriptor.primary.as_deref() != Some(r.node_id.as_str()))
            .map(|r| r.addr.clone())
            .collect();
        for addr in addrs {
            match call(addr.clone()).await {
                Ok(value) => {
                    debug!(group, addr = %addr, "Served by secondary");
                    return Ok(value);
                }
                Err(e) => debug!(group, addr = %addr, error = %e, "Secondary could not serve"),
            }
        }
        Err(primary_error)
    }
}

fn can_fall_back(error: &Error) -> bool {
    error.is_transient() || matches!(error, Error::NotPrimary { .. })
}

/// Address of the group's primary: the node a `NotPrimary` named, else the
/// map's primary, else the first replica
fn primary_addr(map: &ClusterMap, group: ShardGroupId, hint: Option<&str>) -> Result<String> {
    let descriptor = map.group(group).ok_or(Error::ShardNotFound(group))?;
    let replica = hint
        .and_then(|node| descriptor.replica(node))
        .or_else(|| descriptor.primary_replica())
        .or_else(|| descriptor.replicas.first())
        .ok_or_else(|| Error::unavailable(format!("shard group {} has no replicas", group)))?;
    Ok(replica.addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::coordination::{bootstrap_cluster, update_cluster_map, LocalCoordinationClient};
    use crate::cluster::map::PartitionKind;
    use crate::cluster::Ensemble;
    use crate::schema::Row;
    use crate::transport::{LocalNetwork, LocalTransport};

    async fn router() -> (Router, Arc<dyn CoordinationClient>) {
        let clock = Arc::new(ManualClock::default());
        let ensemble = Arc::new(Ensemble::new(3, clock));
        let client: Arc<dyn CoordinationClient> = Arc::new(LocalCoordinationClient::new(ensemble));
        let map = ClusterMap::bootstrap(2, 2, PartitionKind::HashRange, |id| id.to_string());
        bootstrap_cluster(client.as_ref(), &map, 0).await.unwrap();
        let transport = Arc::new(LocalTransport::client(LocalNetwork::new()));
        let config = RouterConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let router = Router::connect(client.clone(), transport, config).await.unwrap();
        (router, client)
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = RouterConfig {
            max_retries: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(3), Duration::from_millis(40));
        assert_eq!(config.backoff(9), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_route_matches_authoritative_map() {
        let (router, client) = router().await;
        let (authoritative, _) = load_cluster_map(client.as_ref()).await.unwrap();
        for i in 0..200 {
            let key = format!("source-{}", i);
            assert_eq!(router.route(&key).unwrap(), authoritative.route(&key).unwrap());
        }
    }

    #[tokio::test]
    async fn test_refresh_picks_up_newer_map() {
        let (router, client) = router().await;
        let before = router.map_version();
        update_cluster_map(client.as_ref(), |map| {
            map.with_primary(1, "node-1-1", 7, 0).map(Some)
        })
        .await
        .unwrap();

        assert_eq!(router.map_version(), before);
        let map = router.refresh().await.unwrap();
        assert_eq!(map.version, before + 1);
        assert_eq!(
            router.group(1).unwrap().primary.as_deref(),
            Some("node-1-1")
        );
    }

    #[tokio::test]
    async fn test_unreachable_group_surfaces_transport_error() {
        let (router, _) = router().await;
        let record = WriteRecord {
            batch_id: "b".into(),
            rows: vec![Row::new("k", 0)],
            map_version: 0,
            row_ids: Vec::new(),
        };
        let err = router.dispatch_write(0, record).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
