//! Shared fixtures for the integration tests

#![allow(dead_code)]

use shardhouse::cluster::LocalCluster;
use shardhouse::config::ClusterConfig;
use shardhouse::schema::Row;
use std::ops::Deref;
use std::sync::Arc;
use tempfile::TempDir;

/// 2024-01-01T00:00:00Z, the default start of the manual clock, in nanoseconds
pub const BASE_TS: i64 = 1_704_067_200_000_000_000;

/// A [`LocalCluster`] whose WAL directories live in a temporary directory
pub struct TestCluster {
    pub cluster: Arc<LocalCluster>,
    _wal: TempDir,
}

impl Deref for TestCluster {
    type Target = LocalCluster;

    fn deref(&self) -> &LocalCluster {
        &self.cluster
    }
}

pub fn test_config(shard_groups: u32, replicas_per_group: usize, wal: &TempDir) -> ClusterConfig {
    let mut config = ClusterConfig::for_testing(shard_groups, replicas_per_group);
    config.wal.wal_dir = wal.path().to_path_buf();
    config
}

pub async fn start(shard_groups: u32, replicas_per_group: usize) -> TestCluster {
    start_with(shard_groups, replicas_per_group, |_| {}).await
}

pub async fn start_with<F>(shard_groups: u32, replicas_per_group: usize, tweak: F) -> TestCluster
where
    F: FnOnce(&mut ClusterConfig),
{
    let wal = TempDir::new().unwrap();
    let mut config = test_config(shard_groups, replicas_per_group, &wal);
    tweak(&mut config);
    let cluster = LocalCluster::start(config).await.unwrap();
    TestCluster {
        cluster: Arc::new(cluster),
        _wal: wal,
    }
}

/// `count` rows with keys `{prefix}-{i}`, values `i` and source `prefix`
pub fn rows(prefix: &str, count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            Row::new(format!("{}-{:04}", prefix, i), BASE_TS + i as i64 * 1_000)
                .with_source(prefix)
                .with_value(i as f64)
                .with_payload(format!("{{\"n\":{}}}", i))
        })
        .collect()
}

/// Rows whose keys all route to `shard` under the cluster's current map
pub fn rows_for_shard(cluster: &LocalCluster, shard: u32, prefix: &str, count: usize) -> Vec<Row> {
    let router = cluster.router();
    (0..)
        .map(|i| {
            Row::new(format!("{}-{:05}", prefix, i), BASE_TS + i as i64)
                .with_source(prefix)
                .with_value(1.0)
        })
        .filter(|row| router.route(&row.key).unwrap() == shard)
        .take(count)
        .collect()
}
