//! ClusterMap: shard groups, replicas and the partition function
//!
//! The map is a plain serde value. The coordination ensemble stores it under
//! [`CLUSTER_MAP_KEY`](super::coordination::CLUSTER_MAP_KEY) and `version`
//! always equals the ensemble's per-key version, so a map update is a CAS
//! from `version` to `version + 1`.

use crate::{Error, NodeId, Result, ShardGroupId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash of a shard key used by every partition scheme
pub fn shard_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Partition function family chosen at bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    HashRange,
    Modulo,
}

impl FromStr for PartitionKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hash_range" | "range" => Ok(Self::HashRange),
            "modulo" | "mod" => Ok(Self::Modulo),
            other => Err(format!(
                "unknown partition kind '{}'; expected hash_range or modulo",
                other
            )),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::HashRange => write!(f, "hash_range"),
            PartitionKind::Modulo => write!(f, "modulo"),
        }
    }
}

/// Inclusive range of the hash space owned by one shard group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
    pub group: ShardGroupId,
}

impl HashRange {
    pub fn contains(&self, hash: u32) -> bool {
        hash >= self.start && hash <= self.end
    }
}

/// Deterministic, total mapping from shard key to shard group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionScheme {
    /// `groups[hash % groups.len()]`
    Modulo { groups: Vec<ShardGroupId> },
    /// Sorted, contiguous ranges covering `0..=u32::MAX`
    HashRange { ranges: Vec<HashRange> },
}

impl PartitionScheme {
    /// Split the hash space evenly across `groups`
    pub fn even(kind: PartitionKind, groups: &[ShardGroupId]) -> Self {
        match kind {
            PartitionKind::Modulo => PartitionScheme::Modulo {
                groups: groups.to_vec(),
            },
            PartitionKind::HashRange => {
                let n = groups.len().max(1) as u64;
                let span = (u32::MAX as u64 + 1) / n;
                let ranges = groups
                    .iter()
                    .enumerate()
                    .map(|(i, group)| {
                        let start = (i as u64 * span) as u32;
                        let end = if i as u64 == n - 1 {
                            u32::MAX
                        } else {
                            ((i as u64 + 1) * span - 1) as u32
                        };
                        HashRange {
                            start,
                            end,
                            group: *group,
                        }
                    })
                    .collect();
                PartitionScheme::HashRange { ranges }
            }
        }
    }

    pub fn kind(&self) -> PartitionKind {
        match self {
            PartitionScheme::Modulo { .. } => PartitionKind::Modulo,
            PartitionScheme::HashRange { .. } => PartitionKind::HashRange,
        }
    }

    /// Group owning `hash`; `None` only for an invalid scheme
    pub fn route_hash(&self, hash: u32) -> Option<ShardGroupId> {
        match self {
            PartitionScheme::Modulo { groups } => {
                if groups.is_empty() {
                    None
                } else {
                    Some(groups[hash as usize % groups.len()])
                }
            }
            PartitionScheme::HashRange { ranges } => {
                let idx = ranges.partition_point(|r| r.end < hash);
                ranges.get(idx).filter(|r| r.contains(hash)).map(|r| r.group)
            }
        }
    }

    /// Groups that own at least one part of the hash space
    pub fn owners(&self) -> Vec<ShardGroupId> {
        let mut owners: Vec<ShardGroupId> = match self {
            PartitionScheme::Modulo { groups } => groups.clone(),
            PartitionScheme::HashRange { ranges } => ranges.iter().map(|r| r.group).collect(),
        };
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    fn validate(&self) -> Result<()> {
        match self {
            PartitionScheme::Modulo { groups } => {
                if groups.is_empty() {
                    return Err(Error::InvalidRequest(
                        "modulo partition has no groups".into(),
                    ));
                }
            }
            PartitionScheme::HashRange { ranges } => {
                let mut expected_start: u64 = 0;
                for range in ranges {
                    if range.start as u64 != expected_start || range.end < range.start {
                        return Err(Error::InvalidRequest(format!(
                            "hash ranges are not contiguous at {:#010x}",
                            range.start
                        )));
                    }
                    expected_start = range.end as u64 + 1;
                }
                if expected_start != u32::MAX as u64 + 1 {
                    return Err(Error::InvalidRequest(
                        "hash ranges do not cover the whole hash space".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Role recorded in the map; the lease in the ensemble is authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub node_id: NodeId,
    /// Transport address (`host:port` for HTTP, the node id in-process)
    pub addr: String,
    pub role: Role,
    /// Last applied sequence number reported at the latest role change
    #[serde(default)]
    pub applied_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: ShardGroupId,
    pub replicas: Vec<Replica>,
    /// Current primary, as last published by the lease holder
    pub primary: Option<NodeId>,
    /// Fencing token of the lease backing `primary`
    #[serde(default)]
    pub epoch: u64,
}

impl ShardGroup {
    pub fn replica(&self, node_id: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node_id == node_id)
    }

    pub fn primary_replica(&self) -> Option<&Replica> {
        self.primary.as_deref().and_then(|p| self.replica(p))
    }

    /// Replicas other than the current primary, in map order
    pub fn secondaries(&self) -> impl Iterator<Item = &Replica> {
        self.replicas
            .iter()
            .filter(move |r| Some(r.node_id.as_str()) != self.primary.as_deref())
    }
}

/// A rebalance that has begun but is not yet authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRebalance {
    pub partition: PartitionScheme,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    pub version: u64,
    pub partition: PartitionScheme,
    pub groups: Vec<ShardGroup>,
    #[serde(default)]
    pub pending: Option<PendingRebalance>,
}

impl ClusterMap {
    /// Build the N x M topology with an even partition and the first
    /// replica of every group as the initial primary hint
    pub fn bootstrap<F>(
        shard_groups: u32,
        replicas_per_group: usize,
        kind: PartitionKind,
        addr_for: F,
    ) -> Self
    where
        F: Fn(&str) -> String,
    {
        let ids: Vec<ShardGroupId> = (0..shard_groups).collect();
        let groups = ids
            .iter()
            .map(|&id| Self::new_group(id, replicas_per_group, &addr_for))
            .collect();
        Self {
            version: 1,
            partition: PartitionScheme::even(kind, &ids),
            groups,
            pending: None,
        }
    }

    /// Descriptor for a fresh group; it owns no hash ranges until a rebalance
    /// that includes it commits
    pub fn new_group<F>(id: ShardGroupId, replicas_per_group: usize, addr_for: &F) -> ShardGroup
    where
        F: Fn(&str) -> String,
    {
        let replicas: Vec<Replica> = (0..replicas_per_group)
            .map(|r| {
                let node_id = node_name(id, r);
                Replica {
                    addr: addr_for(&node_id),
                    node_id,
                    role: if r == 0 { Role::Primary } else { Role::Secondary },
                    applied_seq: 0,
                }
            })
            .collect();
        ShardGroup {
            id,
            primary: replicas.first().map(|r| r.node_id.clone()),
            replicas,
            epoch: 0,
        }
    }

    /// Authoritative group for a shard key
    pub fn route(&self, key: &str) -> Result<ShardGroupId> {
        self.partition
            .route_hash(shard_hash(key))
            .ok_or_else(|| Error::Internal(format!("partition does not cover key {}", key)))
    }

    /// Group a key would move to if the pending rebalance committed
    pub fn pending_route(&self, key: &str) -> Option<ShardGroupId> {
        self.pending
            .as_ref()
            .and_then(|p| p.partition.route_hash(shard_hash(key)))
    }

    pub fn group(&self, id: ShardGroupId) -> Option<&ShardGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: ShardGroupId) -> Option<&mut ShardGroup> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn group_ids(&self) -> Vec<ShardGroupId> {
        self.groups.iter().map(|g| g.id).collect()
    }

    /// Group and replica descriptor for a node
    pub fn locate(&self, node_id: &str) -> Option<(&ShardGroup, &Replica)> {
        self.groups
            .iter()
            .find_map(|g| g.replica(node_id).map(|r| (g, r)))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.groups
            .iter()
            .flat_map(|g| g.replicas.iter().map(|r| r.node_id.clone()))
            .collect()
    }

    /// Whether any partition (authoritative or pending) still maps keys to `id`
    pub fn owns_ranges(&self, id: ShardGroupId) -> bool {
        self.partition.owners().contains(&id)
            || self
                .pending
                .as_ref()
                .is_some_and(|p| p.partition.owners().contains(&id))
    }

    /// Copy of this map with `node_id` published as primary of `group`
    pub fn with_primary(&self, group: ShardGroupId, node_id: &str, epoch: u64, applied_seq: u64) -> Result<Self> {
        let mut next = self.clone();
        let g = next.group_mut(group).ok_or(Error::ShardNotFound(group))?;
        if g.replica(node_id).is_none() {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        for replica in &mut g.replicas {
            if replica.node_id == node_id {
                replica.role = Role::Primary;
                replica.applied_seq = applied_seq;
            } else {
                replica.role = Role::Secondary;
            }
        }
        g.primary = Some(node_id.to_string());
        g.epoch = epoch;
        next.version += 1;
        Ok(next)
    }

    /// Check partition coverage, group references and replica counts
    pub fn validate(&self) -> Result<()> {
        self.partition.validate()?;
        if let Some(pending) = &self.pending {
            pending.partition.validate()?;
        }
        for owner in self.partition.owners() {
            if self.group(owner).is_none() {
                return Err(Error::ShardNotFound(owner));
            }
        }
        if let Some(pending) = &self.pending {
            for owner in pending.partition.owners() {
                if self.group(owner).is_none() {
                    return Err(Error::ShardNotFound(owner));
                }
            }
        }
        let mut ids = self.group_ids();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidRequest("duplicate shard group id".into()));
        }
        for group in &self.groups {
            if group.replicas.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "shard group {} has no replicas",
                    group.id
                )));
            }
            if let Some(primary) = &group.primary {
                if group.replica(primary).is_none() {
                    return Err(Error::NodeNotFound(primary.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Conventional node name for replica `r` of group `g`
pub fn node_name(group: ShardGroupId, replica: usize) -> NodeId {
    format!("node-{}-{}", group, replica)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two(kind: PartitionKind) -> ClusterMap {
        ClusterMap::bootstrap(2, 2, kind, |id| id.to_string())
    }

    #[test]
    fn test_even_hash_ranges_cover_space() {
        for n in 1..=7u32 {
            let ids: Vec<u32> = (0..n).collect();
            let scheme = PartitionScheme::even(PartitionKind::HashRange, &ids);
            assert!(scheme.validate().is_ok(), "{} groups", n);
            assert_eq!(scheme.route_hash(0), Some(0));
            assert_eq!(scheme.route_hash(u32::MAX), Some(n - 1));
        }
    }

    #[test]
    fn test_route_is_deterministic() {
        for kind in [PartitionKind::HashRange, PartitionKind::Modulo] {
            let map = two_by_two(kind);
            for i in 0..200 {
                let key = format!("listing-{}", i);
                let first = map.route(&key).unwrap();
                assert_eq!(first, map.route(&key).unwrap());
                let copy: ClusterMap =
                    serde_json::from_str(&serde_json::to_string(&map).unwrap()).unwrap();
                assert_eq!(first, copy.route(&key).unwrap());
            }
        }
    }

    #[test]
    fn test_route_uses_both_groups() {
        let map = two_by_two(PartitionKind::HashRange);
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..100 {
            seen.insert(map.route(&format!("k{}", i)).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_bootstrap_topology() {
        let map = two_by_two(PartitionKind::HashRange);
        assert_eq!(map.version, 1);
        assert_eq!(map.groups.len(), 2);
        let g1 = map.group(1).unwrap();
        assert_eq!(g1.replicas.len(), 2);
        assert_eq!(g1.primary.as_deref(), Some("node-1-0"));
        assert_eq!(g1.secondaries().count(), 1);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_with_primary_bumps_version() {
        let map = two_by_two(PartitionKind::HashRange);
        let next = map.with_primary(0, "node-0-1", 7, 12).unwrap();
        assert_eq!(next.version, 2);
        let g0 = next.group(0).unwrap();
        assert_eq!(g0.primary.as_deref(), Some("node-0-1"));
        assert_eq!(g0.epoch, 7);
        assert_eq!(g0.replica("node-0-0").unwrap().role, Role::Secondary);
        assert!(map.with_primary(0, "node-1-0", 1, 0).is_err());
    }

    #[test]
    fn test_validate_rejects_gaps() {
        let mut map = two_by_two(PartitionKind::HashRange);
        if let PartitionScheme::HashRange { ranges } = &mut map.partition {
            ranges[1].start += 1;
        }
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_pending_rebalance_overlap() {
        let mut map = two_by_two(PartitionKind::HashRange);
        map.groups
            .push(ClusterMap::new_group(2, 2, &|id: &str| id.to_string()));
        map.pending = Some(PendingRebalance {
            partition: PartitionScheme::even(PartitionKind::HashRange, &[0, 1, 2]),
            started_at_ms: 0,
        });
        assert!(map.validate().is_ok());
        assert!(map.owns_ranges(2));

        // Authoritative routing is unchanged while the rebalance is pending.
        let moved = (0..500)
            .map(|i| format!("k{}", i))
            .find(|k| map.pending_route(k) == Some(2))
            .unwrap();
        assert_ne!(map.route(&moved).unwrap(), 2);
    }

    #[test]
    fn test_partition_kind_parse() {
        assert_eq!("hash_range".parse::<PartitionKind>().unwrap(), PartitionKind::HashRange);
        assert_eq!("MODULO".parse::<PartitionKind>().unwrap(), PartitionKind::Modulo);
        assert!("ring".parse::<PartitionKind>().is_err());
    }
}
