//! Cluster coordination for shardhouse
//!
//! The coordination ensemble owns every piece of shared cluster state: the
//! [`ClusterMap`], replica status and primary leases. Everything else reaches
//! it through a [`CoordinationClient`] and never mutates the map directly.

pub mod admin;
pub mod coordination;
pub mod ensemble;
pub mod lease;
pub mod local;
pub mod map;
pub mod watch;

pub use admin::{ClusterAdmin, ClusterInfo};
pub use coordination::{
    CoordinationClient, LocalCoordinationClient, ReplicaState, ReplicaStatus,
};
pub use ensemble::{Ensemble, ReadView};
pub use lease::{LeaseGuard, LeaseRecord, LeaseToken};
pub use local::{LocalCluster, Wiring};
pub use map::{ClusterMap, PartitionKind, PartitionScheme, Replica, Role, ShardGroup};
pub use watch::{WatchEvent, WatchStream};
