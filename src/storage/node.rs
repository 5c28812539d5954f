//! Storage node: one replica of one shard group
//!
//! All log mutation goes through the sequencer lock (`state`). The primary
//! assigns sequence numbers, appends to its WAL, ships entries to every
//! in-sync secondary and commits once they have all persisted them. A
//! secondary that stops acknowledging is marked unreachable in the ensemble
//! under the primary's lease, which relaxes the quorum to the replicas that
//! remain. Role changes happen only on lease events.
//!
//! Readers never take the sequencer lock: they snapshot `data`, which holds
//! the memtable, the live segment list and the visible sequence number.

use super::compaction;
use super::memtable::Memtable;
use super::replica::{row_set_id, DedupWindow, ReorderBuffer, ReplicaRole, Transition};
use super::segment::{Segment, SegmentMeta};
use super::segment_store::{Manifest, SegmentStore};
use super::wal::{Checkpoint, WriteAheadLog};
use super::{
    FetchLogRequest, LogChunk, LogEntry, NodeStatus, ReadPage, ReadRequest, ReadToken,
    RejoinOutcome, RejoinRequest, ReplicateAck, ReplicateRequest, Snapshot, WriteAck,
    WriteRecord,
};
use crate::clock::Clock;
use crate::cluster::coordination::{
    list_replica_status, load_cluster_map, primary_resource, replica_key, replica_status,
    set_replica_state, update_cluster_map, CoordinationClient, ReplicaState,
};
use crate::cluster::lease::{LeaseGuard, LeaseToken};
use crate::cluster::map::{ClusterMap, Role};
use crate::config::ClusterConfig;
use crate::query::aggregate::fold_batches;
use crate::query::merge::{compare, sort_rows};
use crate::query::{PartialGroup, PartialQuery, PartialResult, Predicate, ResultRow};
use crate::schema::{batch_to_rows, stored_rows_to_batch, validate_rows, StoredRow};
use crate::transport::NodeTransport;
use crate::{Error, NodeId, Result, ShardGroupId};
use arrow_array::RecordBatch;
use futures::future::join_all;
use object_store::ObjectStore;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a node needs to open its replica
pub struct NodeOptions {
    pub node_id: NodeId,
    pub shard: ShardGroupId,
    pub config: ClusterConfig,
    pub coordination: Arc<dyn CoordinationClient>,
    pub transport: Arc<dyn NodeTransport>,
    pub object_store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
}

/// Log state guarded by the sequencer lock
struct ShardState {
    role: ReplicaRole,
    /// Highest fencing epoch observed
    epoch: u64,
    wal: WriteAheadLog,
    /// Highest contiguous persisted sequence number
    last_seq: u64,
    committed_seq: u64,
    /// Visible to reads; never exceeds `committed_seq`
    applied_seq: u64,
    flushed_seq: u64,
    pending: ReorderBuffer,
    dedup: DedupWindow,
    /// Secondaries that must acknowledge before a commit
    in_sync: BTreeSet<NodeId>,
    manifest: Manifest,
    primary_hint: Option<NodeId>,
}

/// What readers see
struct DataState {
    memtable: Memtable,
    segments: Vec<SegmentMeta>,
    visible_seq: u64,
}

/// Copy of the log state for lock-free status and role checks
#[derive(Debug, Clone)]
struct Published {
    role: Role,
    lease_expires_at_ms: i64,
    epoch: u64,
    last_seq: u64,
    committed_seq: u64,
    applied_seq: u64,
    flushed_seq: u64,
    primary_hint: Option<NodeId>,
}

pub struct StorageNode {
    node_id: NodeId,
    shard: ShardGroupId,
    config: ClusterConfig,
    client: Arc<dyn CoordinationClient>,
    transport: Arc<dyn NodeTransport>,
    segments: SegmentStore,
    clock: Arc<dyn Clock>,
    map: RwLock<Arc<ClusterMap>>,
    state: Mutex<ShardState>,
    data: RwLock<DataState>,
    published: RwLock<Published>,
    /// The ensemble marks this replica unreachable
    fenced_out: AtomicBool,
}

impl StorageNode {
    /// Open the replica, replaying its WAL on top of the sealed segments.
    /// Every replica starts as a secondary; the primary lease decides.
    pub async fn open(options: NodeOptions) -> Result<Arc<Self>> {
        let NodeOptions {
            node_id,
            shard,
            config,
            coordination,
            transport,
            object_store,
            clock,
        } = options;

        let (map, _) = load_cluster_map(coordination.as_ref()).await?;
        if map.group(shard).is_none() {
            return Err(Error::ShardNotFound(shard));
        }
        let segments = SegmentStore::new(
            object_store,
            SegmentStore::replica_prefix(&node_id, shard),
            config.storage.segment_cache_bytes,
        );
        let wal = WriteAheadLog::open(config.wal.for_node(&node_id)).await?;
        let manifest = segments.load_manifest().await?;
        let (state, data) = recover(&config, wal, manifest).await?;
        let primary_hint = map.group(shard).and_then(|g| g.primary.clone());

        info!(
            node = %node_id,
            shard,
            last_seq = state.last_seq,
            committed_seq = state.committed_seq,
            flushed_seq = state.flushed_seq,
            epoch = state.epoch,
            segments = data.segments.len(),
            "Storage node opened"
        );

        let node = Arc::new(Self {
            node_id,
            shard,
            config,
            client: coordination,
            transport,
            segments,
            clock,
            map: RwLock::new(Arc::new(map)),
            published: RwLock::new(Published {
                role: Role::Secondary,
                lease_expires_at_ms: 0,
                epoch: state.epoch,
                last_seq: state.last_seq,
                committed_seq: state.committed_seq,
                applied_seq: state.applied_seq,
                flushed_seq: state.flushed_seq,
                primary_hint: primary_hint.clone(),
            }),
            state: Mutex::new(ShardState {
                primary_hint,
                ..state
            }),
            data: RwLock::new(data),
            fenced_out: AtomicBool::new(false),
        });
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shard(&self) -> ShardGroupId {
        self.shard
    }

    pub fn is_primary(&self) -> bool {
        self.published.read().role == Role::Primary
    }

    pub fn status(&self) -> NodeStatus {
        let published = self.published.read().clone();
        let data = self.data.read();
        NodeStatus {
            node_id: self.node_id.clone(),
            shard: self.shard,
            role: published.role,
            epoch: published.epoch,
            last_seq: published.last_seq,
            committed_seq: published.committed_seq,
            applied_seq: published.applied_seq,
            flushed_seq: published.flushed_seq,
            memtable_rows: data.memtable.row_count(),
            segments: data.segments.len(),
            primary_hint: published.primary_hint,
        }
    }

    /// Accept a write record as primary; returns once it is committed
    pub async fn write(&self, shard: ShardGroupId, record: WriteRecord) -> Result<WriteAck> {
        self.check_shard(shard)?;
        validate_rows(&record.rows)?;
        if record.batch_id.is_empty() {
            return Err(Error::InvalidRequest("batch_id must not be empty".into()));
        }
        if !record.row_ids.is_empty() {
            if record.row_ids.len() != record.rows.len() {
                return Err(Error::InvalidRequest(format!(
                    "{} row ids for {} rows",
                    record.row_ids.len(),
                    record.rows.len()
                )));
            }
            if record.batch_id.contains(':') {
                return Err(Error::InvalidRequest(
                    "batch_id of a row-tracked write must not contain ':'".into(),
                ));
            }
            let distinct: BTreeSet<u32> = record.row_ids.iter().copied().collect();
            if distinct.len() != record.row_ids.len() {
                return Err(Error::InvalidRequest("row ids must be distinct".into()));
            }
        }
        self.check_routing(&record).await?;

        let mut state = self.state.lock().await;
        let Some(lease) = state.role.lease().cloned() else {
            return Err(self.not_primary(&state));
        };
        if !self.lease_valid(&lease) {
            self.step_down(&mut state, "lease expired before write").await;
            self.publish(&state);
            return Err(self.not_primary(&state));
        }

        let (batch_id, rows, duplicate_rows) = if record.row_ids.is_empty() {
            if let Some(seq) = state.dedup.get(&record.batch_id) {
                if seq <= state.committed_seq {
                    debug!(shard, seq, batch_id = %record.batch_id, "Duplicate batch");
                    return Ok(WriteAck {
                        shard,
                        seq,
                        duplicate: true,
                        duplicate_rows: Vec::new(),
                    });
                }
                // A retry of an entry left uncommitted: finish it.
                let result = self.replicate_and_commit(&mut state, seq).await;
                self.publish(&state);
                result?;
                return Ok(WriteAck {
                    shard,
                    seq,
                    duplicate: false,
                    duplicate_rows: Vec::new(),
                });
            }
            (record.batch_id, record.rows, Vec::new())
        } else {
            let applied: HashMap<u32, u64> = state
                .dedup
                .rows_of(&record.batch_id)
                .into_iter()
                .flat_map(|(seq, ids)| ids.into_iter().map(move |id| (id, seq)))
                .collect();
            let committed_seq = state.committed_seq;
            let mut fresh_ids = Vec::new();
            let mut fresh_rows = Vec::new();
            let mut duplicate_rows = Vec::new();
            let mut covering_seq = 0;
            let mut unfinished_seq = None;
            for (id, row) in record.row_ids.into_iter().zip(record.rows) {
                match applied.get(&id) {
                    Some(&seq) => {
                        covering_seq = covering_seq.max(seq);
                        if seq <= committed_seq {
                            duplicate_rows.push(id);
                        } else {
                            unfinished_seq = unfinished_seq.max(Some(seq));
                        }
                    }
                    None => {
                        fresh_ids.push(id);
                        fresh_rows.push(row);
                    }
                }
            }
            if let Some(seq) = unfinished_seq {
                let result = self.replicate_and_commit(&mut state, seq).await;
                self.publish(&state);
                result?;
            }
            if fresh_rows.is_empty() {
                debug!(
                    shard,
                    seq = covering_seq,
                    batch_id = %record.batch_id,
                    "Rows already applied"
                );
                return Ok(WriteAck {
                    shard,
                    seq: covering_seq,
                    duplicate: unfinished_seq.is_none(),
                    duplicate_rows,
                });
            }
            (
                row_set_id(&record.batch_id, &fresh_ids),
                fresh_rows,
                duplicate_rows,
            )
        };

        // Finish any uncommitted tail first so sequence numbers stay gapless.
        if state.last_seq > state.committed_seq {
            let through = state.last_seq;
            let result = self.replicate_and_commit(&mut state, through).await;
            if result.is_err() {
                self.publish(&state);
            }
            result?;
        }

        let seq = state.last_seq + 1;
        let row_count = rows.len();
        let entry = LogEntry {
            seq,
            epoch: state.epoch,
            batch_id,
            rows,
        };
        self.append_local(&mut state, &entry).await?;
        let result = self.replicate_and_commit(&mut state, seq).await;
        self.publish(&state);
        result?;
        drop(state);

        debug!(shard, seq, rows = row_count, "Write committed");
        self.flush_if_full().await;
        Ok(WriteAck {
            shard,
            seq,
            duplicate: false,
            duplicate_rows,
        })
    }

    /// Apply entries shipped by the primary
    pub async fn replicate(&self, request: ReplicateRequest) -> Result<ReplicateAck> {
        self.check_shard(request.shard)?;
        let mut state = self.state.lock().await;
        if request.epoch < state.epoch {
            return Err(Error::StaleEpoch {
                shard: self.shard,
                current: state.epoch,
                received: request.epoch,
            });
        }
        if state.role.is_primary() {
            if request.epoch == state.epoch {
                return Err(Error::Internal(format!(
                    "replicate from {} at this primary's own epoch {}",
                    request.primary, request.epoch
                )));
            }
            self.step_down(&mut state, "replicate from a newer epoch").await;
        }
        self.adopt_epoch(&mut state, request.epoch)?;
        state.primary_hint = Some(request.primary.clone());

        let result = self.apply_replicated(&mut state, request).await;
        self.publish(&state);
        result?;
        Ok(ReplicateAck {
            persisted_seq: state.last_seq,
            applied_seq: state.applied_seq,
        })
    }

    /// Replace this replica's contents with a snapshot of the primary's
    pub async fn install_snapshot(&self, snapshot: Snapshot) -> Result<ReplicateAck> {
        self.check_shard(snapshot.shard)?;
        let mut state = self.state.lock().await;
        if snapshot.epoch < state.epoch {
            return Err(Error::StaleEpoch {
                shard: self.shard,
                current: state.epoch,
                received: snapshot.epoch,
            });
        }
        if state.role.is_primary() {
            if snapshot.epoch == state.epoch {
                return Err(Error::Internal(
                    "snapshot offered at this primary's own epoch".into(),
                ));
            }
            self.step_down(&mut state, "snapshot from a newer epoch").await;
        }
        self.adopt_epoch(&mut state, snapshot.epoch)?;

        let result = self.install_snapshot_locked(&mut state, snapshot).await;
        self.publish(&state);
        result?;
        Ok(ReplicateAck {
            persisted_seq: state.last_seq,
            applied_seq: state.applied_seq,
        })
    }

    /// Page through committed rows in `(key, seq, ordinal)` order
    pub async fn read(&self, request: ReadRequest) -> Result<ReadPage> {
        self.check_shard(request.shard)?;
        if request.limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        self.check_serving(request.allow_stale)?;

        let range = Predicate::KeyRange {
            start: request.key_range.start.clone(),
            end: request.key_range.end.clone(),
        };
        let (batches, visible) = self
            .visible_batches(|meta| {
                request
                    .key_range
                    .overlaps(&meta.min_key, &meta.max_key)
            })
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            for row in batch_to_rows(&range.filter(batch)?)? {
                if request
                    .token
                    .as_ref()
                    .map_or(true, |token| after_token(&row, token))
                {
                    rows.push(row);
                }
            }
        }
        rows.sort_by(StoredRow::storage_cmp);
        let has_more = rows.len() > request.limit;
        rows.truncate(request.limit);
        let next_token = if has_more {
            rows.last().map(|last| ReadToken {
                key: last.row.key.clone(),
                seq: last.seq,
                ordinal: last.ordinal,
            })
        } else {
            None
        };
        Ok(ReadPage {
            rows,
            next_token,
            applied_seq: visible,
        })
    }

    /// Evaluate this replica's share of a query
    pub async fn query_partial(&self, request: PartialQuery) -> Result<PartialResult> {
        self.check_shard(request.shard)?;
        if request.limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        self.check_serving(request.allow_stale)?;
        request.predicate.validate()?;

        let (batches, visible) = self
            .visible_batches(|meta| request.predicate.may_match(meta))
            .await?;
        let filtered = batches
            .iter()
            .map(|batch| request.predicate.filter(batch))
            .collect::<Result<Vec<RecordBatch>>>()?;

        let mut result = PartialResult {
            shard: self.shard,
            applied_seq: visible,
            rows: Vec::new(),
            has_more: false,
            groups: Vec::new(),
        };
        if request.aggregation.is_rows() {
            let mut rows = Vec::new();
            for batch in &filtered {
                for row in batch_to_rows(batch)? {
                    let row = ResultRow {
                        shard: self.shard,
                        row,
                    };
                    let after_cursor = request
                        .cursor
                        .as_ref()
                        .map_or(true, |c| compare(&row, c, request.order_by) == Ordering::Greater);
                    if after_cursor {
                        rows.push(row);
                    }
                }
            }
            sort_rows(&mut rows, request.order_by);
            result.has_more = rows.len() > request.limit;
            rows.truncate(request.limit);
            result.rows = rows;
        } else {
            result.groups = fold_batches(&filtered, request.group_by)?
                .into_iter()
                .map(|(group, state)| PartialGroup { group, state })
                .collect();
        }
        Ok(result)
    }

    /// Committed log entries after `after_seq`
    pub async fn fetch_log(&self, request: FetchLogRequest) -> Result<LogChunk> {
        self.check_shard(request.shard)?;
        let state = self.state.lock().await;
        let entries = self
            .log_after(&state, request.after_seq)?
            .into_iter()
            .filter(|e| e.seq <= state.committed_seq)
            .take(request.limit.max(1))
            .collect();
        Ok(LogChunk {
            entries,
            committed_seq: state.committed_seq,
        })
    }

    /// Full committed state of the replica
    pub async fn snapshot(&self, shard: ShardGroupId) -> Result<Snapshot> {
        self.check_shard(shard)?;
        let state = self.state.lock().await;
        self.build_snapshot(&state).await
    }

    /// Primary side of a rejoin: stream what the replica is missing, then
    /// count it toward the commit quorum again
    pub async fn handle_rejoin(&self, request: RejoinRequest) -> Result<RejoinOutcome> {
        self.check_shard(request.shard)?;
        let mut state = self.state.lock().await;
        let Some(lease) = state.role.lease().cloned() else {
            return Err(self.not_primary(&state));
        };
        if !self.lease_valid(&lease) {
            return Err(self.not_primary(&state));
        }
        let addr = self.replica_addr(&request.node_id)?;

        let mut snapshot_installed = false;
        let safe = request.safe_seq;
        let entries = match self.log_after(&state, safe) {
            Ok(entries) if safe <= state.last_seq => entries,
            Ok(_) | Err(Error::SnapshotRequired { .. }) => {
                info!(
                    shard = self.shard,
                    node = %request.node_id,
                    safe_seq = safe,
                    committed_seq = state.committed_seq,
                    "Log does not reach back far enough, shipping snapshot"
                );
                let snapshot = self.build_snapshot(&state).await?;
                tokio::time::timeout(
                    self.config.replication_timeout * 4,
                    self.transport.install_snapshot(&addr, snapshot),
                )
                .await
                .unwrap_or(Err(Error::Timeout))?;
                snapshot_installed = true;
                self.log_after(&state, state.committed_seq)?
            }
            Err(e) => return Err(e),
        };

        let shipment = ReplicateRequest {
            shard: self.shard,
            epoch: state.epoch,
            primary: self.node_id.clone(),
            entries,
            committed_seq: state.committed_seq,
        };
        let ack = tokio::time::timeout(
            self.config.replication_timeout,
            self.transport.replicate(&addr, shipment),
        )
        .await
        .unwrap_or(Err(Error::Timeout))?;
        if ack.persisted_seq < state.last_seq {
            return Err(Error::unavailable(format!(
                "{} persisted through {} of {}",
                request.node_id, ack.persisted_seq, state.last_seq
            )));
        }

        set_replica_state(
            self.client.as_ref(),
            self.shard,
            &request.node_id,
            ReplicaState::InSync,
            Some("rejoined".into()),
            self.clock.now_ms(),
            &lease,
        )
        .await?;
        state.in_sync.insert(request.node_id.clone());
        info!(
            shard = self.shard,
            node = %request.node_id,
            caught_up_to = ack.persisted_seq,
            snapshot_installed,
            "Replica rejoined"
        );
        Ok(RejoinOutcome {
            caught_up_to: ack.persisted_seq,
            snapshot_installed,
        })
    }

    /// Secondary side of a rejoin: drop everything past the applied point
    /// and ask the primary to bring this replica back in sync
    pub async fn rejoin(&self) -> Result<RejoinOutcome> {
        let safe_seq = {
            let mut state = self.state.lock().await;
            if state.role.is_primary() {
                return Err(Error::InvalidRequest("a primary cannot rejoin".into()));
            }
            let safe = state.applied_seq;
            self.truncate_local(&mut state, safe).await?;
            self.publish(&state);
            safe
        };

        let addr = self.primary_addr().await?;
        let outcome = self
            .transport
            .rejoin(
                &addr,
                RejoinRequest {
                    shard: self.shard,
                    node_id: self.node_id.clone(),
                    safe_seq,
                },
            )
            .await?;
        self.fenced_out.store(false, AtomicOrdering::Release);
        Ok(outcome)
    }

    /// Periodic lease maintenance, failover observation and housekeeping
    pub async fn tick(&self) -> Result<()> {
        if let Err(e) = self.refresh_map().await {
            debug!(node = %self.node_id, error = %e, "Cluster map refresh failed");
        }
        let primary = {
            let mut state = self.state.lock().await;
            if state.role.is_primary() {
                let result = self.tick_primary(&mut state).await;
                self.publish(&state);
                result?;
                true
            } else {
                false
            }
        };
        if !primary {
            self.tick_secondary().await?;
        }
        self.maintain().await;
        Ok(())
    }

    /// Seal visible memtable entries into a segment
    pub async fn flush(&self) -> Result<Option<SegmentMeta>> {
        let mut state = self.state.lock().await;
        let through = state.applied_seq;
        if through <= state.flushed_seq {
            return Ok(None);
        }
        let batches = self.data.read().memtable.batches_through(through);
        if batches.is_empty() {
            return Ok(None);
        }

        let segment = Segment::seal(
            new_segment_id(),
            self.shard,
            0,
            &batches,
            self.clock.now_ms(),
        )?;
        let meta = self.segments.put_segment(segment).await?;

        let mut manifest = state.manifest.clone();
        manifest.segments.push(meta.clone());
        manifest.flushed_seq = through;
        manifest.recent_batches = state
            .dedup
            .snapshot()
            .into_iter()
            .filter(|(_, seq)| *seq <= through)
            .collect();
        self.segments.write_manifest(&manifest).await?;

        {
            let mut data = self.data.write();
            data.memtable.take_through(through);
            data.segments = manifest.segments.clone();
        }
        state.manifest = manifest;
        state.flushed_seq = through;
        state.wal.truncate_before(through + 1).await?;
        self.publish(&state);

        info!(
            shard = self.shard,
            node = %self.node_id,
            segment = %meta.segment_id,
            rows = meta.row_count,
            flushed_seq = through,
            "Memtable flushed"
        );
        Ok(Some(meta))
    }

    /// Merge the most crowded segment level once it reaches the trigger
    pub async fn compact(&self) -> Result<Option<SegmentMeta>> {
        let plan = {
            let state = self.state.lock().await;
            compaction::plan(
                &state.manifest.segments,
                self.config.storage.compaction_trigger,
            )
        };
        let Some(plan) = plan else {
            return Ok(None);
        };

        let merged = compaction::merge(
            &self.segments,
            &plan,
            self.shard,
            new_segment_id(),
            self.clock.now_ms(),
        )
        .await?;
        let meta = self.segments.put_segment(merged).await?;

        {
            let mut state = self.state.lock().await;
            let live = plan.sources.iter().all(|source| {
                state
                    .manifest
                    .segments
                    .iter()
                    .any(|s| s.segment_id == source.segment_id)
            });
            if !live {
                drop(state);
                self.segments.delete_segment(&meta.segment_id).await?;
                debug!(shard = self.shard, "Compaction sources changed, result discarded");
                return Ok(None);
            }
            let mut manifest = state.manifest.clone();
            manifest
                .segments
                .retain(|s| !plan.sources.iter().any(|p| p.segment_id == s.segment_id));
            manifest.segments.push(meta.clone());
            self.segments.write_manifest(&manifest).await?;
            self.data.write().segments = manifest.segments.clone();
            state.manifest = manifest;
        }

        for source in &plan.sources {
            if let Err(e) = self.segments.delete_segment(&source.segment_id).await {
                warn!(segment = %source.segment_id, error = %e, "Compacted segment not deleted");
            }
        }
        info!(
            shard = self.shard,
            node = %self.node_id,
            sources = plan.sources.len(),
            level = meta.level,
            rows = meta.row_count,
            "Segments compacted"
        );
        Ok(Some(meta))
    }

    /// Delete segments whose newest row is past the retention window
    pub async fn expire_segments(&self) -> Result<usize> {
        let cutoff = self
            .clock
            .retention_cutoff_nanos(self.config.storage.retention);
        let expired = {
            let mut state = self.state.lock().await;
            let expired = compaction::expired(&state.manifest.segments, cutoff);
            if expired.is_empty() {
                return Ok(0);
            }
            let mut manifest = state.manifest.clone();
            manifest
                .segments
                .retain(|s| !expired.iter().any(|e| e.segment_id == s.segment_id));
            self.segments.write_manifest(&manifest).await?;
            self.data.write().segments = manifest.segments.clone();
            state.manifest = manifest;
            expired
        };
        for segment in &expired {
            if let Err(e) = self.segments.delete_segment(&segment.segment_id).await {
                warn!(segment = %segment.segment_id, error = %e, "Expired segment not deleted");
            }
        }
        info!(
            shard = self.shard,
            node = %self.node_id,
            expired = expired.len(),
            "Segments expired"
        );
        Ok(expired.len())
    }

    async fn tick_primary(&self, state: &mut ShardState) -> Result<()> {
        let Some(lease) = state.role.lease().cloned() else {
            return Ok(());
        };
        match self.client.renew_lease(&lease).await {
            Ok(renewed) => {
                state.role.on_lease_granted(renewed);
            }
            Err(e @ (Error::LeaseExpired { .. } | Error::LeaseDenied { .. })) => {
                self.step_down(state, &e.to_string()).await;
                return Ok(());
            }
            Err(e) => {
                if !self.lease_valid(&lease) {
                    self.step_down(state, "lease could not be renewed").await;
                }
                return Err(e);
            }
        }
        // Heartbeat: carries the commit point and pushes any tail.
        let through = state.last_seq;
        if let Err(e) = self.replicate_and_commit(state, through).await {
            warn!(shard = self.shard, error = %e, "Heartbeat did not commit");
        }
        Ok(())
    }

    async fn tick_secondary(&self) -> Result<()> {
        let (status, version) = replica_status(self.client.as_ref(), self.shard, &self.node_id).await?;
        match status.map(|s| s.state) {
            None => return Ok(()),
            Some(ReplicaState::Unreachable) => {
                self.fenced_out.store(true, AtomicOrdering::Release);
                return match self.rejoin().await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        debug!(node = %self.node_id, error = %e, "Rejoin not possible yet");
                        Ok(())
                    }
                };
            }
            Some(ReplicaState::InSync) => {
                self.fenced_out.store(false, AtomicOrdering::Release);
            }
        }

        let resource = primary_resource(self.shard);
        if let Some(holder) = self.client.lease_holder(&resource).await? {
            if holder.holder != self.node_id {
                let mut state = self.state.lock().await;
                state.primary_hint = Some(holder.holder);
                self.publish(&state);
                return Ok(());
            }
        }

        let guard = LeaseGuard {
            key: replica_key(self.shard, &self.node_id),
            version,
        };
        match self
            .client
            .acquire_lease(&resource, &self.node_id, self.config.lease_ttl, Some(guard))
            .await
        {
            Ok(lease) => {
                let mut state = self.state.lock().await;
                let result = self.promote(&mut state, lease).await;
                self.publish(&state);
                result
            }
            Err(Error::LeaseDenied { holder, .. }) => {
                let mut state = self.state.lock().await;
                state.primary_hint = Some(holder);
                self.publish(&state);
                Ok(())
            }
            // Our status changed between the read and the grant.
            Err(Error::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn promote(&self, state: &mut ShardState, lease: LeaseToken) -> Result<()> {
        let epoch = lease.token;
        if state.role.on_lease_granted(lease) != Transition::Promoted {
            return Ok(());
        }
        if let Err(e) = self.adopt_epoch(state, epoch) {
            state.role.on_lease_lost();
            return Err(e);
        }
        state.pending.clear();
        // Everything persisted is applied once this replica leads.
        state.committed_seq = state.applied_seq;
        state.primary_hint = Some(self.node_id.clone());
        state.in_sync = list_replica_status(self.client.as_ref())
            .await?
            .into_iter()
            .filter(|(group, node, status)| {
                *group == self.shard
                    && *node != self.node_id
                    && status.state == ReplicaState::InSync
            })
            .map(|(_, node, _)| node)
            .collect();

        let shard = self.shard;
        let node_id = self.node_id.clone();
        let applied = state.applied_seq;
        match update_cluster_map(self.client.as_ref(), |map| {
            let current = map.group(shard).ok_or(Error::ShardNotFound(shard))?;
            if current.primary.as_deref() == Some(node_id.as_str()) && current.epoch == epoch {
                return Ok(None);
            }
            map.with_primary(shard, &node_id, epoch, applied).map(Some)
        })
        .await
        {
            Ok(map) => *self.map.write() = Arc::new(map),
            Err(e) => warn!(shard, error = %e, "Could not publish new primary in cluster map"),
        }

        info!(
            shard,
            node = %self.node_id,
            epoch,
            applied_seq = applied,
            last_seq = state.last_seq,
            in_sync = state.in_sync.len(),
            "Promoted to primary"
        );

        let through = state.last_seq;
        if let Err(e) = self.replicate_and_commit(state, through).await {
            warn!(shard, error = %e, "Could not commit inherited tail yet");
        }
        Ok(())
    }

    /// Lease lost: become a secondary and drop the uncommitted tail
    async fn step_down(&self, state: &mut ShardState, reason: &str) {
        if state.role.on_lease_lost() != Transition::Demoted {
            return;
        }
        warn!(
            shard = self.shard,
            node = %self.node_id,
            reason,
            committed_seq = state.committed_seq,
            last_seq = state.last_seq,
            "Stepping down from primary"
        );
        let committed = state.committed_seq;
        if let Err(e) = self.truncate_local(state, committed).await {
            error!(shard = self.shard, error = %e, "Failed to discard uncommitted tail");
        }
        state.in_sync.clear();
        state.primary_hint = None;
    }

    /// Ship `(committed, through]` to every in-sync secondary and commit
    /// through `through` once all of them have persisted it. Secondaries
    /// that fail are marked unreachable first.
    async fn replicate_and_commit(&self, state: &mut ShardState, through: u64) -> Result<()> {
        let Some(lease) = state.role.lease().cloned() else {
            return Err(self.not_primary(state));
        };
        let entries = self
            .data
            .read()
            .memtable
            .entries_between(state.committed_seq, through)?;
        let request = ReplicateRequest {
            shard: self.shard,
            epoch: state.epoch,
            primary: self.node_id.clone(),
            entries,
            committed_seq: state.committed_seq,
        };

        let mut targets = Vec::with_capacity(state.in_sync.len());
        for node in &state.in_sync {
            targets.push((node.clone(), self.replica_addr(node)?));
        }
        let timeout = self.config.replication_timeout;
        let sends = targets.into_iter().map(|(node, addr)| {
            let request = request.clone();
            let transport = Arc::clone(&self.transport);
            async move {
                let result = tokio::time::timeout(timeout, transport.replicate(&addr, request))
                    .await
                    .unwrap_or(Err(Error::Timeout));
                (node, result)
            }
        });

        let mut failed = Vec::new();
        for (node, result) in join_all(sends).await {
            match result {
                Ok(ack) if ack.persisted_seq >= through => {}
                Ok(ack) => failed.push((
                    node,
                    format!("persisted through {} of {}", ack.persisted_seq, through),
                )),
                Err(Error::StaleEpoch { current, .. }) => {
                    self.step_down(state, &format!("secondary has seen epoch {}", current))
                        .await;
                    return Err(self.not_primary(state));
                }
                Err(e) => failed.push((node, e.to_string())),
            }
        }

        for (node, reason) in failed {
            warn!(
                shard = self.shard,
                node = %node,
                reason = %reason,
                "Secondary missed replication, marking unreachable"
            );
            match set_replica_state(
                self.client.as_ref(),
                self.shard,
                &node,
                ReplicaState::Unreachable,
                Some(reason),
                self.clock.now_ms(),
                &lease,
            )
            .await
            {
                Ok(()) => {
                    state.in_sync.remove(&node);
                }
                Err(e @ Error::LeaseExpired { .. }) => {
                    self.step_down(state, &e.to_string()).await;
                    return Err(self.not_primary(state));
                }
                Err(e) => return Err(e),
            }
        }

        if !self.lease_valid(&lease) {
            self.step_down(state, "lease expired during replication").await;
            return Err(self.not_primary(state));
        }
        if through > state.committed_seq {
            state.committed_seq = through;
            state.applied_seq = through;
            self.data.write().visible_seq = through;
            state.wal.store_checkpoint(Checkpoint::CommittedSeq, through)?;
        }
        Ok(())
    }

    async fn apply_replicated(&self, state: &mut ShardState, request: ReplicateRequest) -> Result<()> {
        for entry in request.entries {
            self.accept_entry(state, entry).await?;
        }
        if request.committed_seq > state.committed_seq {
            state.committed_seq = request.committed_seq;
            state.wal.store_checkpoint(Checkpoint::CommittedSeq, state.committed_seq)?;
        }
        let applied = state.last_seq.min(state.committed_seq);
        if applied > state.applied_seq {
            state.applied_seq = applied;
            self.data.write().visible_seq = applied;
        }
        Ok(())
    }

    async fn accept_entry(&self, state: &mut ShardState, entry: LogEntry) -> Result<()> {
        if entry.seq <= state.flushed_seq {
            return Ok(());
        }
        if entry.seq <= state.last_seq {
            let existing = self
                .data
                .read()
                .memtable
                .batch_id(entry.seq)
                .map(str::to_string);
            if existing.as_deref() == Some(entry.batch_id.as_str()) {
                return Ok(());
            }
            if entry.seq <= state.applied_seq {
                return Err(Error::Internal(format!(
                    "entry {} conflicts with applied state at shard {}",
                    entry.seq, self.shard
                )));
            }
            warn!(
                shard = self.shard,
                seq = entry.seq,
                "Replacing divergent uncommitted entries"
            );
            self.truncate_local(state, entry.seq - 1).await?;
        }

        if entry.seq == state.last_seq + 1 {
            self.append_local(state, &entry).await?;
            while let Some(next) = state.pending.pop_next(state.last_seq) {
                self.append_local(state, &next).await?;
            }
        } else {
            debug!(
                shard = self.shard,
                seq = entry.seq,
                last_seq = state.last_seq,
                "Buffering out-of-order entry"
            );
            state.pending.insert(entry);
        }
        Ok(())
    }

    async fn install_snapshot_locked(&self, state: &mut ShardState, snapshot: Snapshot) -> Result<()> {
        let seq = snapshot.committed_seq;
        let mut segments = Vec::new();
        if !snapshot.rows.is_empty() {
            let batch = stored_rows_to_batch(&snapshot.rows)?;
            let segment = Segment::seal(
                new_segment_id(),
                self.shard,
                0,
                &[batch],
                self.clock.now_ms(),
            )?;
            segments.push(self.segments.put_segment(segment).await?);
        }
        let manifest = Manifest {
            segments,
            flushed_seq: seq,
            recent_batches: snapshot.recent_batches.clone(),
        };
        self.segments.write_manifest(&manifest).await?;
        let replaced = std::mem::replace(&mut state.manifest, manifest);

        state.wal.truncate_after(0).await?;
        {
            let mut data = self.data.write();
            data.memtable.clear();
            data.segments = state.manifest.segments.clone();
            data.visible_seq = seq;
        }
        state.last_seq = seq;
        state.committed_seq = seq;
        state.applied_seq = seq;
        state.flushed_seq = seq;
        state.pending.clear();
        state.dedup.clear();
        state.dedup.restore(snapshot.recent_batches);
        state.primary_hint = Some(snapshot.primary);
        state.wal.store_checkpoint(Checkpoint::CommittedSeq, seq)?;

        for old in replaced.segments {
            if let Err(e) = self.segments.delete_segment(&old.segment_id).await {
                warn!(segment = %old.segment_id, error = %e, "Replaced segment not deleted");
            }
        }
        info!(
            shard = self.shard,
            node = %self.node_id,
            committed_seq = seq,
            rows = snapshot.rows.len(),
            "Snapshot installed"
        );
        Ok(())
    }

    async fn build_snapshot(&self, state: &ShardState) -> Result<Snapshot> {
        let committed = state.committed_seq;
        let (metas, mut batches) = {
            let data = self.data.read();
            (data.segments.clone(), data.memtable.batches_through(committed))
        };
        for meta in &metas {
            batches.push(self.segments.get_segment(meta).await?.batch.clone());
        }
        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(batch_to_rows(batch)?);
        }
        rows.sort_by(StoredRow::storage_cmp);
        Ok(Snapshot {
            shard: self.shard,
            epoch: state.epoch,
            primary: self.node_id.clone(),
            committed_seq: committed,
            rows,
            recent_batches: state
                .dedup
                .snapshot()
                .into_iter()
                .filter(|(_, seq)| *seq <= committed)
                .collect(),
        })
    }

    /// Log entries in `(after, last_seq]`, from the memtable when it reaches
    /// back far enough and from the WAL otherwise
    fn log_after(&self, state: &ShardState, after: u64) -> Result<Vec<LogEntry>> {
        if after >= state.last_seq {
            return Ok(Vec::new());
        }
        if after >= state.flushed_seq {
            return self
                .data
                .read()
                .memtable
                .entries_between(after, state.last_seq);
        }
        let entries: Vec<LogEntry> = state
            .wal
            .read_entries_after(after)?
            .into_iter()
            .filter(|e| e.seq <= state.last_seq)
            .collect();
        let contiguous = entries.first().map(|e| e.seq) == Some(after + 1)
            && entries.last().map(|e| e.seq) == Some(state.last_seq)
            && entries.windows(2).all(|w| w[1].seq == w[0].seq + 1);
        if !contiguous {
            return Err(Error::SnapshotRequired {
                shard: self.shard,
                oldest_seq: entries
                    .first()
                    .map_or(state.flushed_seq + 1, |e| e.seq),
            });
        }
        Ok(entries)
    }

    async fn append_local(&self, state: &mut ShardState, entry: &LogEntry) -> Result<()> {
        state.wal.append(entry).await?;
        self.data.write().memtable.insert(entry)?;
        state.dedup.insert(entry.batch_id.clone(), entry.seq);
        state.last_seq = entry.seq;
        Ok(())
    }

    /// Forget every entry after `seq`
    async fn truncate_local(&self, state: &mut ShardState, seq: u64) -> Result<()> {
        state.pending.clear();
        if seq >= state.last_seq {
            return Ok(());
        }
        if seq < state.flushed_seq {
            return Err(Error::Internal(format!(
                "cannot truncate shard {} to {} below flushed seq {}",
                self.shard, seq, state.flushed_seq
            )));
        }
        state.wal.truncate_after(seq).await?;
        let dropped = self.data.write().memtable.truncate_after(seq);
        for batch_id in &dropped {
            state.dedup.remove(batch_id);
        }
        debug!(
            shard = self.shard,
            from = state.last_seq,
            to = seq,
            dropped = dropped.len(),
            "Log truncated"
        );
        state.last_seq = seq;
        state.committed_seq = state.committed_seq.min(seq);
        if state.applied_seq > seq {
            state.applied_seq = seq;
            self.data.write().visible_seq = seq;
        }
        Ok(())
    }

    fn adopt_epoch(&self, state: &mut ShardState, epoch: u64) -> Result<()> {
        if epoch > state.epoch {
            state.epoch = epoch;
            state.wal.store_checkpoint(Checkpoint::Epoch, epoch)?;
        }
        Ok(())
    }

    /// Snapshot of everything visible, retrying when a concurrent compaction
    /// deletes a segment between listing and loading
    async fn visible_batches<F>(&self, keep: F) -> Result<(Vec<RecordBatch>, u64)>
    where
        F: Fn(&SegmentMeta) -> bool,
    {
        const ATTEMPTS: usize = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (metas, mut batches, visible) = {
                let data = self.data.read();
                (
                    data.segments
                        .iter()
                        .filter(|m| keep(m))
                        .cloned()
                        .collect::<Vec<_>>(),
                    data.memtable.batches_through(data.visible_seq),
                    data.visible_seq,
                )
            };
            let mut missing = false;
            for meta in &metas {
                match self.segments.get_segment(meta).await {
                    Ok(segment) => batches.push(segment.batch.clone()),
                    Err(Error::ObjectStore(object_store::Error::NotFound { .. }))
                        if attempt < ATTEMPTS =>
                    {
                        missing = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !missing {
                return Ok((batches, visible));
            }
        }
    }

    async fn flush_if_full(&self) {
        let visible_rows = {
            let data = self.data.read();
            data.memtable.rows_through(data.visible_seq)
        };
        if visible_rows >= self.config.storage.flush_row_count {
            if let Err(e) = self.flush().await {
                warn!(shard = self.shard, error = %e, "Flush failed");
            }
        }
    }

    async fn maintain(&self) {
        self.flush_if_full().await;
        if let Err(e) = self.compact().await {
            warn!(shard = self.shard, error = %e, "Compaction failed");
        }
        if let Err(e) = self.expire_segments().await {
            warn!(shard = self.shard, error = %e, "Retention pass failed");
        }
    }

    fn check_shard(&self, shard: ShardGroupId) -> Result<()> {
        if shard != self.shard {
            return Err(Error::ShardNotFound(shard));
        }
        Ok(())
    }

    /// Rows must belong to this group under the newest map either side knows
    async fn check_routing(&self, record: &WriteRecord) -> Result<()> {
        let mut map = self.map.read().clone();
        if record.map_version > map.version {
            map = self.refresh_map().await?;
        }
        for row in &record.rows {
            if map.route(&row.key)? != self.shard {
                return Err(Error::RoutingMismatch {
                    shard: self.shard,
                    caller_version: record.map_version,
                    current_version: map.version,
                });
            }
        }
        Ok(())
    }

    fn check_serving(&self, allow_stale: bool) -> Result<()> {
        let published = self.published.read();
        if published.role == Role::Primary {
            let margin = (self.config.lease_ttl / 10).as_millis() as i64;
            if self.clock.now_ms() + margin < published.lease_expires_at_ms {
                return Ok(());
            }
        } else if allow_stale {
            if self.fenced_out.load(AtomicOrdering::Acquire) {
                return Err(Error::unavailable(format!(
                    "{} is out of sync for shard {}",
                    self.node_id, self.shard
                )));
            }
            return Ok(());
        }
        Err(Error::NotPrimary {
            shard: self.shard,
            node: self.node_id.clone(),
            primary_hint: published.primary_hint.clone(),
        })
    }

    async fn refresh_map(&self) -> Result<Arc<ClusterMap>> {
        let (map, _) = load_cluster_map(self.client.as_ref()).await?;
        let mut cached = self.map.write();
        if map.version > cached.version {
            *cached = Arc::new(map);
        }
        Ok(Arc::clone(&cached))
    }

    fn replica_addr(&self, node_id: &str) -> Result<String> {
        let map = self.map.read();
        map.group(self.shard)
            .and_then(|g| g.replica(node_id))
            .map(|r| r.addr.clone())
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    async fn primary_addr(&self) -> Result<String> {
        let holder = self
            .client
            .lease_holder(&primary_resource(self.shard))
            .await?
            .ok_or_else(|| {
                Error::unavailable(format!("shard {} has no live primary", self.shard))
            })?;
        self.replica_addr(&holder.holder)
    }

    fn lease_valid(&self, lease: &LeaseToken) -> bool {
        lease.valid_at(self.clock.now_ms(), self.config.lease_ttl / 10)
    }

    fn not_primary(&self, state: &ShardState) -> Error {
        Error::NotPrimary {
            shard: self.shard,
            node: self.node_id.clone(),
            primary_hint: state
                .primary_hint
                .clone()
                .filter(|hint| *hint != self.node_id),
        }
    }

    fn publish(&self, state: &ShardState) {
        *self.published.write() = Published {
            role: state.role.role(),
            lease_expires_at_ms: state.role.lease().map_or(0, |l| l.expires_at_ms),
            epoch: state.epoch,
            last_seq: state.last_seq,
            committed_seq: state.committed_seq,
            applied_seq: state.applied_seq,
            flushed_seq: state.flushed_seq,
            primary_hint: state.primary_hint.clone(),
        };
    }
}

/// Rebuild log state from the manifest, the WAL and the checkpoints
async fn recover(
    config: &ClusterConfig,
    mut wal: WriteAheadLog,
    manifest: Manifest,
) -> Result<(ShardState, DataState)> {
    let flushed = manifest.flushed_seq;
    let mut memtable = Memtable::new();
    let mut dedup = DedupWindow::new(config.storage.batch_window);
    dedup.restore(manifest.recent_batches.clone());

    let mut last = flushed;
    for entry in wal.read_entries_after(flushed)? {
        if entry.seq != last + 1 {
            warn!(
                expected = last + 1,
                found = entry.seq,
                "Gap in WAL replay, discarding the rest"
            );
            break;
        }
        memtable.insert(&entry)?;
        dedup.insert(entry.batch_id.clone(), entry.seq);
        last = entry.seq;
    }
    if wal.last_seq() > last {
        wal.truncate_after(last).await?;
    }

    let committed = wal.load_checkpoint(Checkpoint::CommittedSeq)?.max(flushed);
    let epoch = wal.load_checkpoint(Checkpoint::Epoch)?;
    let applied = committed.min(last);
    let data = DataState {
        memtable,
        segments: manifest.segments.clone(),
        visible_seq: applied,
    };
    let state = ShardState {
        role: ReplicaRole::Secondary,
        epoch,
        wal,
        last_seq: last,
        committed_seq: committed,
        applied_seq: applied,
        flushed_seq: flushed,
        pending: ReorderBuffer::default(),
        dedup,
        in_sync: BTreeSet::new(),
        manifest,
        primary_hint: None,
    };
    Ok((state, data))
}

fn after_token(row: &StoredRow, token: &ReadToken) -> bool {
    row.row
        .key
        .as_str()
        .cmp(token.key.as_str())
        .then(row.seq.cmp(&token.seq))
        .then(row.ordinal.cmp(&token.ordinal))
        == Ordering::Greater
}

fn new_segment_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::coordination::{bootstrap_cluster, LocalCoordinationClient};
    use crate::cluster::map::PartitionKind;
    use crate::cluster::Ensemble;
    use crate::schema::Row;
    use crate::storage::KeyRange;
    use crate::transport::local::{LocalNetwork, LocalTransport};
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        config: ClusterConfig,
        clock: Arc<ManualClock>,
        client: Arc<dyn CoordinationClient>,
        network: Arc<LocalNetwork>,
        store: Arc<dyn ObjectStore>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = ClusterConfig::for_testing(1, 2);
            config.wal.wal_dir = dir.path().to_path_buf();
            let clock = Arc::new(ManualClock::default());
            let ensemble = Arc::new(Ensemble::new(3, clock.clone()));
            let client: Arc<dyn CoordinationClient> =
                Arc::new(LocalCoordinationClient::new(ensemble));
            let map = ClusterMap::bootstrap(1, 2, PartitionKind::HashRange, |id| id.to_string());
            bootstrap_cluster(client.as_ref(), &map, clock.now_ms())
                .await
                .unwrap();
            Self {
                _dir: dir,
                config,
                clock,
                client,
                network: LocalNetwork::new(),
                store: Arc::new(InMemory::new()),
            }
        }

        async fn open(&self, node_id: &str) -> Arc<StorageNode> {
            let node = StorageNode::open(NodeOptions {
                node_id: node_id.to_string(),
                shard: 0,
                config: self.config.clone(),
                coordination: self.client.clone(),
                transport: Arc::new(LocalTransport::for_node(self.network.clone(), node_id)),
                object_store: self.store.clone(),
                clock: self.clock.clone(),
            })
            .await
            .unwrap();
            self.network.register(node.clone());
            node
        }

        /// node-0-0 primary, node-0-1 secondary
        async fn pair(&self) -> (Arc<StorageNode>, Arc<StorageNode>) {
            let primary = self.open("node-0-0").await;
            let secondary = self.open("node-0-1").await;
            primary.tick().await.unwrap();
            secondary.tick().await.unwrap();
            assert!(primary.is_primary());
            assert!(!secondary.is_primary());
            (primary, secondary)
        }
    }

    fn record(batch_id: &str, keys: &[&str]) -> WriteRecord {
        WriteRecord {
            batch_id: batch_id.to_string(),
            rows: keys
                .iter()
                .map(|k| Row::new(*k, 1_704_067_200_000_000_000).with_value(1.0))
                .collect(),
            map_version: 0,
            row_ids: Vec::new(),
        }
    }

    fn read_all(allow_stale: bool) -> ReadRequest {
        ReadRequest {
            shard: 0,
            key_range: KeyRange::all(),
            token: None,
            limit: 100,
            allow_stale,
        }
    }

    #[tokio::test]
    async fn test_write_commits_on_both_replicas() {
        let harness = Harness::new().await;
        let (primary, secondary) = harness.pair().await;

        let ack = primary.write(0, record("b1", &["a", "b"])).await.unwrap();
        assert_eq!(ack.seq, 1);
        assert!(!ack.duplicate);
        assert_eq!(secondary.status().last_seq, 1);

        // The commit point reaches the secondary with the next heartbeat.
        primary.tick().await.unwrap();
        let page = secondary.read(read_all(true)).await.unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.applied_seq, 1);

        let page = primary.read(read_all(false)).await.unwrap();
        assert_eq!(page.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_secondary_rejects_writes_and_strict_reads() {
        let harness = Harness::new().await;
        let (_primary, secondary) = harness.pair().await;

        match secondary.write(0, record("b1", &["a"])).await {
            Err(Error::NotPrimary { primary_hint, .. }) => {
                assert_eq!(primary_hint.as_deref(), Some("node-0-0"))
            }
            other => panic!("expected NotPrimary, got {:?}", other),
        }
        assert!(matches!(
            secondary.read(read_all(false)).await,
            Err(Error::NotPrimary { .. })
        ));
    }

    #[tokio::test]
    async fn test_retried_batch_is_acknowledged_once() {
        let harness = Harness::new().await;
        let (primary, _secondary) = harness.pair().await;

        let first = primary.write(0, record("b1", &["a"])).await.unwrap();
        let again = primary.write(0, record("b1", &["a"])).await.unwrap();
        assert_eq!(first.seq, again.seq);
        assert!(again.duplicate);
        assert_eq!(primary.read(read_all(false)).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_row_tracked_retry_writes_only_new_rows() {
        let harness = Harness::new().await;
        let (primary, secondary) = harness.pair().await;
        let tracked = |keys: &[&str], ids: Vec<u32>| WriteRecord {
            row_ids: ids,
            ..record("b1", keys)
        };

        let first = primary.write(0, tracked(&["a", "b"], vec![0, 2])).await.unwrap();
        assert!(first.duplicate_rows.is_empty());

        // The retry carries the same rows plus one that routed elsewhere before.
        let retry = primary
            .write(0, tracked(&["a", "x", "b"], vec![0, 1, 2]))
            .await
            .unwrap();
        assert_eq!(retry.seq, first.seq + 1);
        assert!(!retry.duplicate);
        assert_eq!(retry.duplicate_rows, vec![0, 2]);

        let again = primary
            .write(0, tracked(&["x", "a", "b"], vec![1, 0, 2]))
            .await
            .unwrap();
        assert!(again.duplicate);
        assert_eq!(again.seq, retry.seq);
        assert_eq!(again.duplicate_rows, vec![1, 0, 2]);

        primary.tick().await.unwrap();
        assert_eq!(primary.read(read_all(false)).await.unwrap().rows.len(), 3);
        assert_eq!(secondary.read(read_all(true)).await.unwrap().rows.len(), 3);

        let mismatched = primary.write(0, tracked(&["a"], vec![0, 1])).await;
        assert!(matches!(mismatched, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_unreachable_secondary_is_dropped_from_quorum() {
        let harness = Harness::new().await;
        let (primary, _secondary) = harness.pair().await;
        harness.network.set_reachable("node-0-1", false);

        let ack = primary.write(0, record("b1", &["a"])).await.unwrap();
        assert_eq!(ack.seq, 1);
        let (status, _) = replica_status(harness.client.as_ref(), 0, "node-0-1")
            .await
            .unwrap();
        assert_eq!(status.map(|s| s.state), Some(ReplicaState::Unreachable));

        // Later writes commit without waiting for it.
        primary.write(0, record("b2", &["b"])).await.unwrap();
        assert_eq!(primary.status().committed_seq, 2);
    }

    #[tokio::test]
    async fn test_rejoin_catches_up_from_the_log() {
        let harness = Harness::new().await;
        let (primary, secondary) = harness.pair().await;
        harness.network.set_reachable("node-0-1", false);
        primary.write(0, record("b1", &["a"])).await.unwrap();
        primary.write(0, record("b2", &["b"])).await.unwrap();
        harness.network.set_reachable("node-0-1", true);

        secondary.tick().await.unwrap();
        assert_eq!(secondary.status().last_seq, 2);
        let (status, _) = replica_status(harness.client.as_ref(), 0, "node-0-1")
            .await
            .unwrap();
        assert_eq!(status.map(|s| s.state), Some(ReplicaState::InSync));

        primary.tick().await.unwrap();
        let page = secondary.read(read_all(true)).await.unwrap();
        assert_eq!(page.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_flushed_rows_survive_reopen() {
        let harness = Harness::new().await;
        let (primary, _secondary) = harness.pair().await;
        primary.write(0, record("b1", &["a", "b"])).await.unwrap();
        let meta = primary.flush().await.unwrap().unwrap();
        assert_eq!(meta.row_count, 2);
        primary.write(0, record("b2", &["c"])).await.unwrap();

        harness.network.unregister("node-0-0");
        drop(primary);
        let reopened = harness.open("node-0-0").await;
        let status = reopened.status();
        assert_eq!(status.flushed_seq, 1);
        assert_eq!(status.last_seq, 2);
        assert_eq!(status.segments, 1);
        assert_eq!(status.memtable_rows, 1);
    }

    #[tokio::test]
    async fn test_lease_loss_steps_down() {
        let harness = Harness::new().await;
        let (primary, _secondary) = harness.pair().await;
        harness.clock.advance(harness.config.lease_ttl * 2);

        assert!(matches!(
            primary.write(0, record("b1", &["a"])).await,
            Err(Error::NotPrimary { .. })
        ));
        assert!(!primary.is_primary());
    }
}
