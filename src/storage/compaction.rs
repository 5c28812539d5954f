//! Segment compaction and retention
//!
//! Compaction merges every segment of the most crowded level into one
//! sorted segment one level up. It never changes row contents: the merged
//! segment holds exactly the union of its sources.

use super::segment::{Segment, SegmentMeta};
use super::segment_store::SegmentStore;
use crate::{Error, Result, ShardGroupId};
use arrow_array::RecordBatch;
use std::collections::BTreeMap;

/// Segments selected for one compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    pub source_level: u32,
    pub sources: Vec<SegmentMeta>,
}

impl CompactionPlan {
    pub fn target_level(&self) -> u32 {
        self.source_level + 1
    }
}

/// The level with the most segments, once it reaches `trigger`
pub fn plan(segments: &[SegmentMeta], trigger: usize) -> Option<CompactionPlan> {
    let mut levels: BTreeMap<u32, Vec<SegmentMeta>> = BTreeMap::new();
    for segment in segments {
        levels
            .entry(segment.level)
            .or_default()
            .push(segment.clone());
    }
    levels
        .into_iter()
        .filter(|(_, sources)| sources.len() >= trigger.max(2))
        // Lowest level wins ties.
        .max_by(|(la, a), (lb, b)| a.len().cmp(&b.len()).then(lb.cmp(la)))
        .map(|(source_level, sources)| CompactionPlan {
            source_level,
            sources,
        })
}

/// Merge the plan's sources into a single segment
pub async fn merge(
    store: &SegmentStore,
    plan: &CompactionPlan,
    shard: ShardGroupId,
    segment_id: String,
    created_at_ms: i64,
) -> Result<Segment> {
    if plan.sources.is_empty() {
        return Err(Error::InvalidRequest("nothing to compact".into()));
    }
    let mut batches: Vec<RecordBatch> = Vec::with_capacity(plan.sources.len());
    for meta in &plan.sources {
        batches.push(store.get_segment(meta).await?.batch.clone());
    }
    Segment::seal(
        segment_id,
        shard,
        plan.target_level(),
        &batches,
        created_at_ms,
    )
}

/// Segments whose newest row is older than `cutoff_nanos`
pub fn expired(segments: &[SegmentMeta], cutoff_nanos: i64) -> Vec<SegmentMeta> {
    segments
        .iter()
        .filter(|s| s.max_timestamp < cutoff_nanos)
        .cloned()
        .collect()
}
