//! Segment objects and the per-replica manifest in object storage
//!
//! Layout under a replica's prefix:
//!
//! ```text
//! {prefix}/manifest.json          live segments, flushed_seq, dedup window
//! {prefix}/segments/{id}.seg      encoded segments
//! ```
//!
//! The manifest is the commit point: a segment object that is not listed in
//! it does not exist for readers and is garbage after a crash.
//!
//! Decoded segments are cached in memory up to a byte budget, weighed by
//! their Arrow buffer size. Evicted segments are read back from the store.

use super::segment::{Segment, SegmentMeta};
use crate::{Error, Result};
use moka::future::Cache;
use object_store::{path::Path, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// Durable list of a replica's live segments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub segments: Vec<SegmentMeta>,
    /// Every entry up to here is sealed in `segments`
    #[serde(default)]
    pub flushed_seq: u64,
    /// Dedup window at the time of the last manifest write
    #[serde(default)]
    pub recent_batches: Vec<(String, u64)>,
}

impl Manifest {
    pub fn row_count(&self) -> u64 {
        self.segments.iter().map(|s| s.row_count).sum()
    }
}

/// Object-store access for one replica's segments
#[derive(Clone)]
pub struct SegmentStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    cache: Cache<String, Arc<Segment>>,
}

impl fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentStore")
            .field("prefix", &self.prefix)
            .field("cached_segments", &self.cache.entry_count())
            .field("cached_bytes", &self.cache.weighted_size())
            .finish()
    }
}

impl SegmentStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, cache_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_bytes)
            .weigher(|_id: &String, segment: &Arc<Segment>| segment_weight(segment))
            .build();
        Self {
            store,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            cache,
        }
    }

    /// Conventional prefix of a replica
    pub fn replica_prefix(node_id: &str, shard: crate::ShardGroupId) -> String {
        format!("replicas/{}/shard-{}", node_id, shard)
    }

    fn segment_path(&self, segment_id: &str) -> Path {
        Path::from(format!("{}/segments/{}.seg", self.prefix, segment_id))
    }

    fn manifest_path(&self) -> Path {
        Path::from(format!("{}/{}", self.prefix, MANIFEST_FILE))
    }

    pub async fn load_manifest(&self) -> Result<Manifest> {
        match self.store.get(&self.manifest_path()).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec(manifest)?;
        self.store
            .put(&self.manifest_path(), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn put_segment(&self, segment: Segment) -> Result<SegmentMeta> {
        let bytes = segment.encode()?;
        let path = self.segment_path(&segment.meta.segment_id);
        self.store.put(&path, PutPayload::from(bytes)).await?;
        debug!(
            segment = %segment.meta.segment_id,
            rows = segment.meta.row_count,
            level = segment.meta.level,
            "Segment written"
        );
        let meta = segment.meta.clone();
        self.cache
            .insert(meta.segment_id.clone(), Arc::new(segment))
            .await;
        Ok(meta)
    }

    /// Load a segment, validating its header against `meta`
    pub async fn get_segment(&self, meta: &SegmentMeta) -> Result<Arc<Segment>> {
        if let Some(cached) = self.cache.get(&meta.segment_id).await {
            return Ok(cached);
        }
        let bytes = self
            .store
            .get(&self.segment_path(&meta.segment_id))
            .await?
            .bytes()
            .await?;
        let segment = Segment::decode(bytes)?;
        if segment.meta.segment_id != meta.segment_id || segment.meta.row_count != meta.row_count {
            return Err(Error::CorruptSegment(format!(
                "segment {} does not match its manifest entry",
                meta.segment_id
            )));
        }
        let segment = Arc::new(segment);
        self.cache
            .insert(meta.segment_id.clone(), Arc::clone(&segment))
            .await;
        Ok(segment)
    }

    pub async fn delete_segment(&self, segment_id: &str) -> Result<()> {
        self.cache.invalidate(segment_id).await;
        match self.store.delete(&self.segment_path(segment_id)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => {
                warn!(segment = %segment_id, error = %e, "Failed to delete segment");
                Err(e.into())
            }
        }
    }

    /// Drop cached decoded segments, e.g. after a crash simulation
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}

fn segment_weight(segment: &Segment) -> u32 {
    u32::try_from(segment.batch.get_array_memory_size()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{rows_to_batch, Row};
    use object_store::memory::InMemory;

    fn segment(id: &str) -> Segment {
        let batch = rows_to_batch(&[Row::new("a", 1), Row::new("b", 2)], 1).unwrap();
        Segment::seal(id.to_string(), 0, 0, &[batch], 0).unwrap()
    }

    #[tokio::test]
    async fn test_manifest_defaults_when_absent() {
        let store = SegmentStore::new(Arc::new(InMemory::new()), "replicas/node-0-0/shard-0", 1 << 20);
        assert_eq!(store.load_manifest().await.unwrap(), Manifest::default());
    }

    #[tokio::test]
    async fn test_segment_survives_cache_loss() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = SegmentStore::new(Arc::clone(&object_store), "p", 1 << 20);
        let meta = store.put_segment(segment("s1")).await.unwrap();

        let manifest = Manifest {
            segments: vec![meta.clone()],
            flushed_seq: 1,
            recent_batches: vec![("b-1".into(), 1)],
        };
        store.write_manifest(&manifest).await.unwrap();

        let reopened = SegmentStore::new(object_store, "p", 1 << 20);
        assert_eq!(reopened.load_manifest().await.unwrap(), manifest);
        let loaded = reopened.get_segment(&meta).await.unwrap();
        assert_eq!(loaded.batch.num_rows(), 2);

        reopened.delete_segment("s1").await.unwrap();
        reopened.clear_cache();
        assert!(reopened.get_segment(&meta).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_stays_within_its_byte_budget() {
        let budget = 2 * segment_weight(&segment("s0")) as u64;
        let store = SegmentStore::new(Arc::new(InMemory::new()), "p", budget);
        let mut metas = Vec::new();
        for i in 0..5 {
            metas.push(store.put_segment(segment(&format!("s{i}"))).await.unwrap());
        }
        store.cache.run_pending_tasks().await;
        assert!(store.cache.weighted_size() <= budget);
        assert!(store.cache.entry_count() <= 2);

        // Evicted segments are read back from the object store.
        for meta in &metas {
            let loaded = store.get_segment(meta).await.unwrap();
            assert_eq!(loaded.meta.segment_id, meta.segment_id);
        }
        store.cache.run_pending_tasks().await;
        assert!(store.cache.weighted_size() <= budget);
    }
}
