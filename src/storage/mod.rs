//! Storage node: one replica of one shard group
//!
//! A replica persists write records in its WAL, keeps them in a memtable
//! until they are sealed into immutable segments, and replicates them from
//! primary to secondaries. The request and response types below are the node
//! RPC contract shared by the in-process and HTTP transports.

pub mod compaction;
pub mod memtable;
pub mod node;
pub mod replica;
pub mod segment;
pub mod segment_store;
pub mod wal;

pub use node::StorageNode;
pub use replica::ReplicaRole;
pub use segment::{SegmentMeta, SEGMENT_FORMAT_VERSION};

use crate::cluster::map::Role;
use crate::schema::{Row, StoredRow};
use crate::{NodeId, ShardGroupId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage tunables shared by every replica
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Flush the memtable once it holds this many visible rows
    pub flush_row_count: usize,
    /// Compact a level once it holds this many segments
    pub compaction_trigger: usize,
    /// Segments whose newest row is older than this are deleted
    pub retention: Duration,
    /// Recent batch ids remembered for deduplication
    pub batch_window: usize,
    /// Decoded segments kept in memory per replica, in bytes
    pub segment_cache_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_row_count: 100_000,
            compaction_trigger: 8,
            retention: Duration::from_secs(30 * 86_400),
            batch_window: 4096,
            segment_cache_bytes: 256 * 1024 * 1024,
        }
    }
}

/// One entry of a shard's replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    /// Fencing epoch of the primary that assigned `seq`
    pub epoch: u64,
    pub batch_id: String,
    pub rows: Vec<Row>,
}

/// A row batch submitted to a shard group's primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    /// Client-assigned id; retries with the same id are applied once
    pub batch_id: String,
    pub rows: Vec<Row>,
    /// Cluster map version the caller routed with
    #[serde(default)]
    pub map_version: u64,
    /// Position of each row in the caller's batch. When set, dedup is per
    /// row: rows of `batch_id` this group already holds are skipped, so a
    /// retry that routes differently neither loses nor repeats rows.
    #[serde(default)]
    pub row_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub shard: ShardGroupId,
    pub seq: u64,
    /// The batch id had already been committed at `seq`
    #[serde(default)]
    pub duplicate: bool,
    /// Row ids of a row-tracked write that an earlier attempt committed
    #[serde(default)]
    pub duplicate_rows: Vec<u32>,
}

/// Primary to secondary log shipment; an empty `entries` is a heartbeat
/// carrying the commit point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub shard: ShardGroupId,
    pub epoch: u64,
    pub primary: NodeId,
    pub entries: Vec<LogEntry>,
    pub committed_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateAck {
    /// Highest contiguous sequence number durably persisted
    pub persisted_seq: u64,
    /// Highest sequence number visible to reads
    pub applied_seq: u64,
}

/// Half-open key range `[start, end)`; `None` is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.start.as_deref().map_or(true, |s| key >= s)
            && self.end.as_deref().map_or(true, |e| key < e)
    }

    /// Whether `[min, max]` can hold a key in this range
    pub fn overlaps(&self, min: &str, max: &str) -> bool {
        self.start.as_deref().map_or(true, |s| max >= s)
            && self.end.as_deref().map_or(true, |e| min < e)
    }
}

/// Position after the last row a read page returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadToken {
    pub key: String,
    pub seq: u64,
    pub ordinal: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub shard: ShardGroupId,
    #[serde(default)]
    pub key_range: KeyRange,
    #[serde(default)]
    pub token: Option<ReadToken>,
    pub limit: usize,
    /// Secondaries may answer
    #[serde(default)]
    pub allow_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadPage {
    pub rows: Vec<StoredRow>,
    /// Present when more rows follow; pass back to resume
    #[serde(default)]
    pub next_token: Option<ReadToken>,
    /// Sequence number the page is consistent with
    pub applied_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLogRequest {
    pub shard: ShardGroupId,
    pub after_seq: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub entries: Vec<LogEntry>,
    pub committed_seq: u64,
}

/// Full committed state of a shard, shipped when the log no longer reaches
/// back far enough for a rejoining replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub shard: ShardGroupId,
    pub epoch: u64,
    pub primary: NodeId,
    pub committed_seq: u64,
    pub rows: Vec<StoredRow>,
    /// `(batch_id, seq)` pairs of the dedup window
    #[serde(default)]
    pub recent_batches: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinRequest {
    pub shard: ShardGroupId,
    pub node_id: NodeId,
    /// Everything up to here is known to match the primary's log
    pub safe_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinOutcome {
    pub caught_up_to: u64,
    pub snapshot_installed: bool,
}

/// Replica state reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub shard: ShardGroupId,
    pub role: Role,
    pub epoch: u64,
    pub last_seq: u64,
    pub committed_seq: u64,
    pub applied_seq: u64,
    pub flushed_seq: u64,
    pub memtable_rows: usize,
    pub segments: usize,
    #[serde(default)]
    pub primary_hint: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_bounds() {
        let range = KeyRange::new("b", "d");
        assert!(!range.contains("a"));
        assert!(range.contains("b"));
        assert!(range.contains("cz"));
        assert!(!range.contains("d"));
        assert!(KeyRange::all().contains(""));

        assert!(range.overlaps("a", "b"));
        assert!(!range.overlaps("d", "z"));
        assert!(!range.overlaps("a", "az"));
    }

    #[test]
    fn test_write_record_optional_fields() {
        let record: WriteRecord =
            serde_json::from_str(r#"{"batch_id":"b","rows":[],"added_later":true}"#).unwrap();
        assert_eq!(record.map_version, 0);
    }
}
