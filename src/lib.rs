//! # shardhouse
//!
//! A sharded, replicated columnar storage layer for analytical row data.
//!
//! Rows are partitioned by key across N shard groups. Each group holds M
//! replicas: one lease-holding primary accepts writes and replicates them to
//! its secondaries before acknowledging. A small coordination ensemble owns
//! the authoritative cluster map and the primary leases.
//!
//! ## Components
//!
//! - **Coordination**: quorum-replicated key/value store with leases and watches
//! - **Storage Node**: WAL, memtable, immutable segments, replication and failover
//! - **Router**: maps keys to shard groups and retries against map changes
//! - **Query Coordinator**: scatter-gather queries with partial aggregation
//! - **Ingestion Gateway**: batch splitting with idempotent per-shard retries

pub mod api;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod ingest;
pub mod query;
pub mod router;
pub mod schema;
pub mod storage;
pub mod telemetry;
pub mod transport;

mod error;

pub use config::ClusterConfig as Config;
pub use error::{Error, ErrorBody, Result, ShardFailure};

/// Identifier of a shard group
pub type ShardGroupId = u32;

/// Identifier of a storage node (one replica of one shard group)
pub type NodeId = String;

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::cluster::{ClusterMap, LocalCluster, PartitionKind};
    pub use crate::config::ClusterConfig;
    pub use crate::ingest::{IngestConfig, IngestRequest, IngestResponse, IngestionGateway};
    pub use crate::query::{ConsistencyMode, Predicate, QueryCoordinator, QueryRequest, QueryResponse};
    pub use crate::router::Router;
    pub use crate::schema::Row;
    pub use crate::storage::StorageNode;
    pub use crate::{Error, NodeId, Result, ShardGroupId};
}
