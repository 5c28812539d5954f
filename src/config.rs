//! Cluster configuration and component factory
//!
//! `ClusterConfig` describes an N x M topology plus the tunables of every
//! component. Values come from defaults, `SHARDHOUSE_*` environment variables
//! and, in the server binary, command-line flags layered on top.

use crate::cluster::map::PartitionKind;
use crate::ingest::IngestConfig;
use crate::query::QueryConfig;
use crate::router::RouterConfig;
use crate::storage::wal::{WalConfig, WalSyncMode};
use crate::storage::StorageConfig;
use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Full configuration of a shardhouse cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of shard groups (N)
    pub shard_groups: u32,
    /// Replicas per shard group (M)
    pub replicas_per_group: usize,
    /// Coordination ensemble members
    pub ensemble_size: usize,
    /// Partition function used at bootstrap
    pub partition: PartitionKind,
    /// Primary lease time-to-live
    pub lease_ttl: Duration,
    /// How often a primary renews its lease
    pub lease_renew_interval: Duration,
    /// How long a primary waits for a secondary acknowledgement
    pub replication_timeout: Duration,
    pub router: RouterConfig,
    pub query: QueryConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub wal: WalConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shard_groups: 2,
            replicas_per_group: 2,
            ensemble_size: 3,
            partition: PartitionKind::HashRange,
            lease_ttl: Duration::from_secs(10),
            lease_renew_interval: Duration::from_secs(3),
            replication_timeout: Duration::from_secs(2),
            router: RouterConfig::default(),
            query: QueryConfig::default(),
            ingest: IngestConfig::default(),
            storage: StorageConfig::default(),
            wal: WalConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from `SHARDHOUSE_*` environment variables
    ///
    /// Durations are given in milliseconds (`SHARDHOUSE_LEASE_TTL_MS=10000`).
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            shard_groups: env_parse("SHARDHOUSE_SHARD_GROUPS", defaults.shard_groups)?,
            replicas_per_group: env_parse(
                "SHARDHOUSE_REPLICAS_PER_GROUP",
                defaults.replicas_per_group,
            )?,
            ensemble_size: env_parse("SHARDHOUSE_ENSEMBLE_SIZE", defaults.ensemble_size)?,
            partition: env_parse("SHARDHOUSE_PARTITION", defaults.partition)?,
            lease_ttl: env_millis("SHARDHOUSE_LEASE_TTL_MS", defaults.lease_ttl)?,
            lease_renew_interval: env_millis(
                "SHARDHOUSE_LEASE_RENEW_INTERVAL_MS",
                defaults.lease_renew_interval,
            )?,
            replication_timeout: env_millis(
                "SHARDHOUSE_REPLICATION_TIMEOUT_MS",
                defaults.replication_timeout,
            )?,
            router: RouterConfig {
                max_retries: env_parse("SHARDHOUSE_ROUTER_MAX_RETRIES", defaults.router.max_retries)?,
                base_backoff: env_millis(
                    "SHARDHOUSE_ROUTER_BASE_BACKOFF_MS",
                    defaults.router.base_backoff,
                )?,
                max_backoff: env_millis(
                    "SHARDHOUSE_ROUTER_MAX_BACKOFF_MS",
                    defaults.router.max_backoff,
                )?,
            },
            query: QueryConfig {
                shard_timeout: env_millis(
                    "SHARDHOUSE_QUERY_SHARD_TIMEOUT_MS",
                    defaults.query.shard_timeout,
                )?,
                stale_reads: env_parse("SHARDHOUSE_QUERY_STALE_READS", defaults.query.stale_reads)?,
                default_limit: env_parse(
                    "SHARDHOUSE_QUERY_DEFAULT_LIMIT",
                    defaults.query.default_limit,
                )?,
            },
            ingest: IngestConfig {
                max_attempts: env_parse("SHARDHOUSE_INGEST_MAX_ATTEMPTS", defaults.ingest.max_attempts)?,
                max_batch_rows: env_parse(
                    "SHARDHOUSE_INGEST_MAX_BATCH_ROWS",
                    defaults.ingest.max_batch_rows,
                )?,
                retry_backoff: env_millis(
                    "SHARDHOUSE_INGEST_RETRY_BACKOFF_MS",
                    defaults.ingest.retry_backoff,
                )?,
            },
            storage: StorageConfig {
                flush_row_count: env_parse(
                    "SHARDHOUSE_FLUSH_ROW_COUNT",
                    defaults.storage.flush_row_count,
                )?,
                compaction_trigger: env_parse(
                    "SHARDHOUSE_COMPACTION_TRIGGER",
                    defaults.storage.compaction_trigger,
                )?,
                retention: Duration::from_secs(
                    env_parse(
                        "SHARDHOUSE_RETENTION_DAYS",
                        defaults.storage.retention.as_secs() / 86_400,
                    )? * 86_400,
                ),
                batch_window: env_parse("SHARDHOUSE_BATCH_WINDOW", defaults.storage.batch_window)?,
                segment_cache_bytes: env_parse(
                    "SHARDHOUSE_SEGMENT_CACHE_BYTES",
                    defaults.storage.segment_cache_bytes,
                )?,
            },
            wal: WalConfig {
                wal_dir: std::env::var("SHARDHOUSE_WAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.wal.wal_dir),
                max_segment_size: env_parse(
                    "SHARDHOUSE_WAL_MAX_SEGMENT_SIZE",
                    defaults.wal.max_segment_size,
                )?,
                sync_mode: match std::env::var("SHARDHOUSE_WAL_SYNC_MODE") {
                    Ok(raw) => raw.parse::<WalSyncMode>()?,
                    Err(_) => defaults.wal.sync_mode,
                },
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject topologies and timings the cluster cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.shard_groups == 0 {
            return Err(Error::Config("shard_groups must be at least 1".into()));
        }
        if self.replicas_per_group == 0 {
            return Err(Error::Config("replicas_per_group must be at least 1".into()));
        }
        if self.ensemble_size == 0 || self.ensemble_size % 2 == 0 {
            return Err(Error::Config(format!(
                "ensemble_size must be odd and non-zero, got {}",
                self.ensemble_size
            )));
        }
        if self.lease_renew_interval >= self.lease_ttl {
            return Err(Error::Config(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_ttl ({:?})",
                self.lease_renew_interval, self.lease_ttl
            )));
        }
        if self.ingest.max_attempts == 0 {
            return Err(Error::Config("ingest max_attempts must be at least 1".into()));
        }
        if self.storage.batch_window == 0 {
            return Err(Error::Config("batch_window must be at least 1".into()));
        }
        Ok(())
    }

    /// Small, fast-expiring configuration for tests and local experiments
    pub fn for_testing(shard_groups: u32, replicas_per_group: usize) -> Self {
        Self {
            shard_groups,
            replicas_per_group,
            lease_ttl: Duration::from_secs(5),
            lease_renew_interval: Duration::from_secs(1),
            replication_timeout: Duration::from_millis(500),
            router: RouterConfig {
                max_retries: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            ingest: IngestConfig {
                retry_backoff: Duration::from_millis(1),
                ..IngestConfig::default()
            },
            wal: WalConfig {
                sync_mode: WalSyncMode::None,
                ..WalConfig::default()
            },
            ..Self::default()
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{name}: invalid value '{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let millis = env_parse(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the segment object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "local" or "s3"
    /// - STORAGE_PATH: root directory (required for local)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY: optional, IAM role otherwise
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory segment store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "local" => {
                let root = std::env::var("STORAGE_PATH").map_err(|_| {
                    Error::Config("STORAGE_PATH required when STORAGE_BACKEND=local".to_string())
                })?;
                std::fs::create_dir_all(&root)?;
                info!(root = %root, "Using local filesystem segment store");
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&root)?))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(bucket = %bucket, region = %region, "Using S3 segment store");

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                backend
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_two_by_two() {
        let config = ClusterConfig::default();
        assert_eq!(config.shard_groups, 2);
        assert_eq!(config.replicas_per_group, 2);
        assert_eq!(config.ensemble_size, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_topologies() {
        let mut config = ClusterConfig::default();
        config.shard_groups = 0;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.ensemble_size = 4;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.lease_renew_interval = config.lease_ttl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_is_valid() {
        let config = ClusterConfig::for_testing(3, 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.shard_groups, 3);
    }
}
