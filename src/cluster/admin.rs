//! Cluster administration: shard groups, rebalances and inspection
//!
//! Every change is a CAS on the cluster map through
//! [`update_cluster_map`](super::coordination::update_cluster_map). A
//! rebalance is two steps: `begin_rebalance` stores the new partition as
//! `pending` next to the authoritative one (both visible, only the old one
//! routes), then `commit_rebalance` swaps it in or `abort_rebalance` drops it.
//! Rows are not moved between groups, so a group can only be removed once
//! none of its replicas holds rows.

use super::coordination::{
    bootstrap_replica_status, list_replica_status, load_cluster_map, remove_replica_status,
    update_cluster_map, CoordinationClient, ReplicaStatus,
};
use super::lease::LeaseRecord;
use super::map::{ClusterMap, PartitionKind, PartitionScheme, PendingRebalance, ShardGroup};
use crate::clock::Clock;
use crate::transport::NodeTransport;
use crate::{Error, Result, ShardGroupId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Maps a node id to its transport address
pub type AddrResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Live view of a lease for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    #[serde(flatten)]
    pub record: LeaseRecord,
    pub live: bool,
}

/// Snapshot of cluster state returned by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub map: ClusterMap,
    pub leases: Vec<LeaseInfo>,
    pub replicas: Vec<ReplicaStatusEntry>,
    /// Set when the ensemble had no quorum and the view may be behind
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatusEntry {
    pub shard: ShardGroupId,
    pub node_id: String,
    #[serde(flatten)]
    pub status: ReplicaStatus,
}

pub struct ClusterAdmin {
    client: Arc<dyn CoordinationClient>,
    clock: Arc<dyn Clock>,
    /// Asks replicas whether they still hold rows before their group goes
    transport: Arc<dyn NodeTransport>,
    replicas_per_group: usize,
    addr_for: AddrResolver,
}

impl ClusterAdmin {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn NodeTransport>,
        replicas_per_group: usize,
        addr_for: AddrResolver,
    ) -> Self {
        Self {
            client,
            clock,
            transport,
            replicas_per_group,
            addr_for,
        }
    }

    pub async fn cluster_map(&self) -> Result<ClusterMap> {
        Ok(load_cluster_map(self.client.as_ref()).await?.0)
    }

    pub async fn leases(&self) -> Result<Vec<LeaseInfo>> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .client
            .list_leases()
            .await?
            .into_iter()
            .map(|record| LeaseInfo {
                live: record.is_live(now_ms),
                record,
            })
            .collect())
    }

    /// Map, lease holders and replica status in one view
    pub async fn inspect(&self) -> Result<ClusterInfo> {
        let (map, stale) = load_cluster_map(self.client.as_ref()).await?;
        let leases = self.leases().await?;
        let replicas = list_replica_status(self.client.as_ref())
            .await?
            .into_iter()
            .map(|(shard, node_id, status)| ReplicaStatusEntry {
                shard,
                node_id,
                status,
            })
            .collect();
        Ok(ClusterInfo {
            map,
            leases,
            replicas,
            stale,
        })
    }

    /// Register a new shard group. It owns no hash ranges until a rebalance
    /// that includes it is committed.
    pub async fn add_shard_group(&self) -> Result<(ClusterMap, ShardGroupId)> {
        let replicas = self.replicas_per_group;
        let addr_for = Arc::clone(&self.addr_for);
        let mut added = 0;
        let map = update_cluster_map(self.client.as_ref(), |current| {
            let id = current.groups.iter().map(|g| g.id + 1).max().unwrap_or(0);
            let resolve = |node: &str| addr_for(node);
            let mut next = current.clone();
            next.groups.push(ClusterMap::new_group(id, replicas, &resolve));
            added = id;
            Ok(Some(next))
        })
        .await?;

        let group = map.group(added).ok_or(Error::ShardNotFound(added))?;
        bootstrap_replica_status(self.client.as_ref(), group, self.clock.now_ms()).await?;
        info!(shard = added, version = map.version, "Shard group added");
        Ok((map, added))
    }

    /// Remove a group that no partition maps keys to and whose replicas
    /// hold no rows. A replica that does not answer blocks the removal.
    pub async fn remove_shard_group(&self, id: ShardGroupId) -> Result<ClusterMap> {
        let (current, _) = load_cluster_map(self.client.as_ref()).await?;
        let group = current.group(id).ok_or(Error::ShardNotFound(id))?;
        if current.owns_ranges(id) {
            return Err(owns_ranges_error(id));
        }
        self.ensure_empty(group).await?;

        let map = update_cluster_map(self.client.as_ref(), |current| {
            if current.group(id).is_none() {
                return Err(Error::ShardNotFound(id));
            }
            if current.owns_ranges(id) {
                return Err(owns_ranges_error(id));
            }
            let mut next = current.clone();
            next.groups.retain(|g| g.id != id);
            Ok(Some(next))
        })
        .await?;
        remove_replica_status(self.client.as_ref(), id).await?;
        info!(shard = id, version = map.version, "Shard group removed");
        Ok(map)
    }

    async fn ensure_empty(&self, group: &ShardGroup) -> Result<()> {
        for replica in &group.replicas {
            let status = self.transport.status(&replica.addr).await.map_err(|e| {
                Error::unavailable(format!(
                    "cannot confirm shard group {} is empty, {} did not answer: {}",
                    group.id, replica.node_id, e
                ))
            })?;
            // Entries persisted but not yet applied count as rows too.
            let unapplied = status.last_seq.saturating_sub(status.applied_seq);
            if status.memtable_rows > 0 || status.segments > 0 || unapplied > 0 {
                return Err(Error::InvalidRequest(format!(
                    "shard group {} still holds rows on {} ({} buffered, {} segments, {} unapplied entries)",
                    group.id, replica.node_id, status.memtable_rows, status.segments, unapplied
                )));
            }
        }
        Ok(())
    }

    /// Store an even partition over `groups` (default: every group) as pending
    pub async fn begin_rebalance(
        &self,
        kind: Option<PartitionKind>,
        groups: Option<Vec<ShardGroupId>>,
    ) -> Result<ClusterMap> {
        let started_at_ms = self.clock.now_ms();
        let map = update_cluster_map(self.client.as_ref(), |current| {
            if current.pending.is_some() {
                return Err(Error::InvalidRequest(
                    "a rebalance is already in progress".into(),
                ));
            }
            let targets = groups.clone().unwrap_or_else(|| current.group_ids());
            if targets.is_empty() {
                return Err(Error::InvalidRequest("rebalance needs at least one group".into()));
            }
            if let Some(missing) = targets.iter().find(|id| current.group(**id).is_none()) {
                return Err(Error::ShardNotFound(*missing));
            }
            let kind = kind.unwrap_or_else(|| current.partition.kind());
            let mut next = current.clone();
            next.pending = Some(PendingRebalance {
                partition: PartitionScheme::even(kind, &targets),
                started_at_ms,
            });
            Ok(Some(next))
        })
        .await?;
        info!(version = map.version, "Rebalance started");
        Ok(map)
    }

    /// Make the pending partition authoritative
    pub async fn commit_rebalance(&self) -> Result<ClusterMap> {
        let map = update_cluster_map(self.client.as_ref(), |current| {
            let Some(pending) = &current.pending else {
                return Err(Error::InvalidRequest("no rebalance in progress".into()));
            };
            let mut next = current.clone();
            next.partition = pending.partition.clone();
            next.pending = None;
            Ok(Some(next))
        })
        .await?;
        info!(version = map.version, "Rebalance committed");
        Ok(map)
    }

    pub async fn abort_rebalance(&self) -> Result<ClusterMap> {
        let map = update_cluster_map(self.client.as_ref(), |current| {
            if current.pending.is_none() {
                return Ok(None);
            }
            let mut next = current.clone();
            next.pending = None;
            Ok(Some(next))
        })
        .await?;
        info!(version = map.version, "Rebalance aborted");
        Ok(map)
    }
}

fn owns_ranges_error(id: ShardGroupId) -> Error {
    Error::InvalidRequest(format!(
        "shard group {} still owns hash ranges; rebalance it away first",
        id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::coordination::{bootstrap_cluster, LocalCoordinationClient};
    use crate::cluster::ensemble::Ensemble;
    use crate::transport::{LocalNetwork, LocalTransport};

    async fn admin() -> ClusterAdmin {
        let clock = Arc::new(ManualClock::default());
        let client = Arc::new(LocalCoordinationClient::new(Arc::new(Ensemble::new(
            3,
            clock.clone(),
        ))));
        let map = ClusterMap::bootstrap(2, 2, PartitionKind::HashRange, |id| id.to_string());
        bootstrap_cluster(client.as_ref(), &map, 0).await.unwrap();
        // No nodes are running, so no replica can vouch for an empty group.
        let transport = Arc::new(LocalTransport::client(LocalNetwork::new()));
        ClusterAdmin::new(client, clock, transport, 2, Arc::new(|id: &str| id.to_string()))
    }

    #[tokio::test]
    async fn test_add_group_then_rebalance() {
        let admin = admin().await;
        let (map, id) = admin.add_shard_group().await.unwrap();
        assert_eq!(id, 2);
        assert!(!map.owns_ranges(2));

        let pending = admin.begin_rebalance(None, None).await.unwrap();
        assert!(pending.owns_ranges(2));
        assert!(admin.begin_rebalance(None, None).await.is_err());

        let committed = admin.commit_rebalance().await.unwrap();
        assert!(committed.pending.is_none());
        assert_eq!(committed.partition.owners(), vec![0, 1, 2]);

        let info = admin.inspect().await.unwrap();
        assert_eq!(info.replicas.len(), 6);
    }

    #[tokio::test]
    async fn test_remove_requires_no_ranges_and_answering_replicas() {
        let admin = admin().await;
        assert!(matches!(
            admin.remove_shard_group(1).await,
            Err(Error::InvalidRequest(_))
        ));

        admin.begin_rebalance(None, Some(vec![0])).await.unwrap();
        admin.abort_rebalance().await.unwrap();
        assert!(admin.remove_shard_group(1).await.is_err());

        admin.begin_rebalance(None, Some(vec![0])).await.unwrap();
        admin.commit_rebalance().await.unwrap();
        assert!(matches!(
            admin.remove_shard_group(1).await,
            Err(Error::Unavailable { .. })
        ));
        assert_eq!(admin.cluster_map().await.unwrap().group_ids(), vec![0, 1]);
        assert!(matches!(
            admin.remove_shard_group(7).await,
            Err(Error::ShardNotFound(7))
        ));
    }
}
