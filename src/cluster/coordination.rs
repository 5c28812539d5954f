//! Access path to the coordination ensemble
//!
//! Every component reads, watches and proposes cluster state through a
//! [`CoordinationClient`]; nothing else holds a reference to the ensemble.
//! The typed helpers at the bottom encode the key layout:
//!
//! - `cluster/map`              JSON [`ClusterMap`]
//! - `replicas/{group}/{node}`  JSON [`ReplicaStatus`]
//! - `leases/shard/{group}/primary`  primary lease of a shard group

use super::ensemble::{Ensemble, ReadView, VersionedValue};
use super::lease::{LeaseGuard, LeaseRecord, LeaseToken};
use super::map::{ClusterMap, ShardGroup};
use super::watch::WatchStream;
use crate::{Error, Result, ShardGroupId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const CLUSTER_MAP_KEY: &str = "cluster/map";
pub const REPLICA_PREFIX: &str = "replicas/";

/// Client interface to the coordination ensemble
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<ReadView>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;

    /// Compare-and-set; returns the committed version
    async fn propose(&self, key: &str, expected_version: u64, value: Vec<u8>) -> Result<u64>;

    /// Compare-and-set that commits only while `fence` is the live lease
    async fn propose_fenced(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        fence: &LeaseToken,
    ) -> Result<u64>;

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()>;

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream>;

    async fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        guard: Option<LeaseGuard>,
    ) -> Result<LeaseToken>;

    async fn renew_lease(&self, lease: &LeaseToken) -> Result<LeaseToken>;

    async fn release_lease(&self, lease: &LeaseToken) -> Result<()>;

    async fn lease_holder(&self, resource: &str) -> Result<Option<LeaseRecord>>;

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>>;

    /// Whether mutations can currently commit
    async fn has_quorum(&self) -> bool;
}

/// In-process client with a per-client connectivity switch
#[derive(Debug)]
pub struct LocalCoordinationClient {
    ensemble: Arc<Ensemble>,
    connected: AtomicBool,
}

impl LocalCoordinationClient {
    pub fn new(ensemble: Arc<Ensemble>) -> Self {
        Self {
            ensemble,
            connected: AtomicBool::new(true),
        }
    }

    /// Fault injection: a disconnected client sees the ensemble as unreachable
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensemble(&self) -> Result<&Ensemble> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(&self.ensemble)
        } else {
            Err(Error::unavailable("coordination ensemble unreachable"))
        }
    }
}

#[async_trait]
impl CoordinationClient for LocalCoordinationClient {
    async fn get(&self, key: &str) -> Result<ReadView> {
        self.ensemble()?.get(key)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        Ok(self.ensemble()?.list(prefix)?.0)
    }

    async fn propose(&self, key: &str, expected_version: u64, value: Vec<u8>) -> Result<u64> {
        self.ensemble()?.propose(key, expected_version, value)
    }

    async fn propose_fenced(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        fence: &LeaseToken,
    ) -> Result<u64> {
        self.ensemble()?
            .propose_fenced(key, expected_version, value, fence)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        self.ensemble()?.delete(key, expected_version)
    }

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream> {
        self.ensemble()?.watch(prefix, from_revision)
    }

    async fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        guard: Option<LeaseGuard>,
    ) -> Result<LeaseToken> {
        self.ensemble()?
            .acquire_lease(resource, holder, ttl, guard.as_ref())
    }

    async fn renew_lease(&self, lease: &LeaseToken) -> Result<LeaseToken> {
        self.ensemble()?.renew_lease(lease)
    }

    async fn release_lease(&self, lease: &LeaseToken) -> Result<()> {
        self.ensemble()?.release_lease(lease)
    }

    async fn lease_holder(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        self.ensemble()?.lease_holder(resource)
    }

    async fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        self.ensemble()?.list_leases()
    }

    async fn has_quorum(&self) -> bool {
        self.ensemble().map(|e| e.has_quorum()).unwrap_or(false)
    }
}

/// Replication health of one replica as recorded by its group's primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Receives every write; counts toward the commit quorum
    InSync,
    /// Missed writes; must rejoin before it may serve or promote
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn replica_key(group: ShardGroupId, node_id: &str) -> String {
    format!("{}{}/{}", REPLICA_PREFIX, group, node_id)
}

/// Lease resource naming the primary of a shard group
pub fn primary_resource(group: ShardGroupId) -> String {
    format!("shard/{}/primary", group)
}

/// Load the authoritative cluster map; `stale` is set below majority
pub async fn load_cluster_map(client: &dyn CoordinationClient) -> Result<(ClusterMap, bool)> {
    let view = client.get(CLUSTER_MAP_KEY).await?;
    let bytes = view
        .value
        .ok_or_else(|| Error::Internal("cluster map has not been bootstrapped".into()))?;
    let map: ClusterMap = serde_json::from_slice(&bytes)?;
    Ok((map, view.stale))
}

/// Publish `map` as the successor of version `map.version - 1`
pub async fn store_cluster_map(client: &dyn CoordinationClient, map: &ClusterMap) -> Result<()> {
    map.validate()?;
    client
        .propose(
            CLUSTER_MAP_KEY,
            map.version.saturating_sub(1),
            serde_json::to_vec(map)?,
        )
        .await?;
    Ok(())
}

/// Apply `update` to the current map and CAS the result, re-reading on conflict
pub async fn update_cluster_map<F>(client: &dyn CoordinationClient, mut update: F) -> Result<ClusterMap>
where
    F: FnMut(&ClusterMap) -> Result<Option<ClusterMap>> + Send,
{
    const MAX_ATTEMPTS: usize = 5;

    for _ in 0..MAX_ATTEMPTS {
        let (current, stale) = load_cluster_map(client).await?;
        if stale {
            return Err(Error::unavailable("cannot update cluster map without quorum"));
        }
        let Some(mut next) = update(&current)? else {
            return Ok(current);
        };
        next.version = current.version + 1;
        match store_cluster_map(client, &next).await {
            Ok(()) => return Ok(next),
            Err(Error::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::unavailable("cluster map update kept conflicting"))
}

/// Bootstrap the map and mark every replica in-sync; a no-op when a map exists
pub async fn bootstrap_cluster(
    client: &dyn CoordinationClient,
    map: &ClusterMap,
    now_ms: i64,
) -> Result<()> {
    match store_cluster_map(client, map).await {
        Ok(()) => {}
        Err(Error::Conflict { .. }) => return Ok(()),
        Err(e) => return Err(e),
    }
    for group in &map.groups {
        bootstrap_replica_status(client, group, now_ms).await?;
    }
    info!(
        version = map.version,
        groups = map.groups.len(),
        "Cluster map bootstrapped"
    );
    Ok(())
}

/// Create in-sync status keys for a new group's replicas; existing keys are kept
pub async fn bootstrap_replica_status(
    client: &dyn CoordinationClient,
    group: &ShardGroup,
    now_ms: i64,
) -> Result<()> {
    let status = serde_json::to_vec(&ReplicaStatus {
        state: ReplicaState::InSync,
        updated_at_ms: now_ms,
        reason: None,
    })?;
    for replica in &group.replicas {
        match client
            .propose(&replica_key(group.id, &replica.node_id), 0, status.clone())
            .await
        {
            Ok(_) | Err(Error::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Every recorded replica status as `(group, node, status)`
pub async fn list_replica_status(
    client: &dyn CoordinationClient,
) -> Result<Vec<(ShardGroupId, String, ReplicaStatus)>> {
    let mut out = Vec::new();
    for (key, value) in client.list(REPLICA_PREFIX).await? {
        let Some((group, node)) = key[REPLICA_PREFIX.len()..].split_once('/') else {
            continue;
        };
        let Ok(group) = group.parse::<ShardGroupId>() else {
            continue;
        };
        out.push((group, node.to_string(), serde_json::from_slice(&value.value)?));
    }
    Ok(out)
}

/// Drop the status keys of a removed group
pub async fn remove_replica_status(client: &dyn CoordinationClient, group: ShardGroupId) -> Result<()> {
    let prefix = format!("{}{}/", REPLICA_PREFIX, group);
    for (key, value) in client.list(&prefix).await? {
        match client.delete(&key, value.version).await {
            Ok(()) | Err(Error::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Status of a replica and the version of its status key
pub async fn replica_status(
    client: &dyn CoordinationClient,
    group: ShardGroupId,
    node_id: &str,
) -> Result<(Option<ReplicaStatus>, u64)> {
    let view = client.get(&replica_key(group, node_id)).await?;
    let status = view
        .value
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?;
    Ok((status, view.version))
}

/// Record a replica's state under the primary's lease
pub async fn set_replica_state(
    client: &dyn CoordinationClient,
    group: ShardGroupId,
    node_id: &str,
    state: ReplicaState,
    reason: Option<String>,
    now_ms: i64,
    fence: &LeaseToken,
) -> Result<()> {
    let key = replica_key(group, node_id);
    let status = ReplicaStatus {
        state,
        updated_at_ms: now_ms,
        reason,
    };
    let value = serde_json::to_vec(&status)?;
    let mut attempts = 0;
    loop {
        let (_, version) = replica_status(client, group, node_id).await?;
        match client
            .propose_fenced(&key, version, value.clone(), fence)
            .await
        {
            Ok(_) => return Ok(()),
            Err(Error::Conflict { .. }) if attempts < 5 => attempts += 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::map::PartitionKind;

    fn client() -> LocalCoordinationClient {
        let clock = Arc::new(ManualClock::default());
        LocalCoordinationClient::new(Arc::new(Ensemble::new(3, clock)))
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let client = client();
        let map = ClusterMap::bootstrap(2, 2, PartitionKind::HashRange, |id| id.to_string());
        bootstrap_cluster(&client, &map, 0).await.unwrap();
        bootstrap_cluster(&client, &map, 0).await.unwrap();

        let (loaded, stale) = load_cluster_map(&client).await.unwrap();
        assert!(!stale);
        assert_eq!(loaded, map);

        let (status, version) = replica_status(&client, 1, "node-1-1").await.unwrap();
        assert_eq!(status.unwrap().state, ReplicaState::InSync);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_update_cluster_map_bumps_version() {
        let client = client();
        let map = ClusterMap::bootstrap(2, 2, PartitionKind::Modulo, |id| id.to_string());
        bootstrap_cluster(&client, &map, 0).await.unwrap();

        let next = update_cluster_map(&client, |m| Ok(Some(m.with_primary(0, "node-0-1", 9, 0)?)))
            .await
            .unwrap();
        assert_eq!(next.version, 2);
        let (loaded, _) = load_cluster_map(&client).await.unwrap();
        assert_eq!(loaded.group(0).unwrap().primary.as_deref(), Some("node-0-1"));
    }

    #[tokio::test]
    async fn test_disconnected_client_is_unavailable() {
        let client = client();
        client.set_connected(false);
        assert!(matches!(
            client.get(CLUSTER_MAP_KEY).await,
            Err(Error::Unavailable { .. })
        ));
        assert!(!client.has_quorum().await);
    }
}
