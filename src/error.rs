//! Error types for shardhouse

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias for shardhouse operations
pub type Result<T> = std::result::Result<T, Error>;

/// One shard group's share of a partially failed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    /// Shard group that failed
    pub shard: u32,
    /// Shard keys whose rows were not committed
    #[serde(default)]
    pub keys: Vec<String>,
    /// Rendered cause
    pub error: String,
}

/// Error types for shardhouse
#[derive(Debug)]
pub enum Error {
    /// Quorum or majority unreachable; retry with backoff
    Unavailable { reason: String },
    /// The contacted replica is not the primary of the shard group
    NotPrimary {
        shard: u32,
        node: String,
        primary_hint: Option<String>,
    },
    /// Version mismatch on a coordinated write
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    /// Some shard groups succeeded, some failed
    PartialFailure { failures: Vec<ShardFailure> },
    /// The caller routed with an outdated cluster map
    RoutingMismatch {
        shard: u32,
        caller_version: u64,
        current_version: u64,
    },
    /// Another holder owns a live lease on the resource
    LeaseDenied {
        resource: String,
        holder: String,
        expires_at_ms: i64,
    },
    /// The lease is gone or no longer owned by the caller
    LeaseExpired { resource: String },
    /// A request carried a fencing epoch older than one already observed
    StaleEpoch { shard: u32, current: u64, received: u64 },
    /// The log no longer reaches back far enough; install a snapshot
    SnapshotRequired { shard: u32, oldest_seq: u64 },
    /// Shard group not present in the cluster map
    ShardNotFound(u32),
    /// Node not known to the transport
    NodeNotFound(String),
    /// Transient network failure
    Transport(String),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled by its caller
    Cancelled,
    /// Malformed request
    InvalidRequest(String),
    /// Segment bytes failed validation
    CorruptSegment(String),
    /// WAL device is out of space
    WalFull,
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Errors the router retries with backoff before surfacing them
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unavailable { .. } | Error::Transport(_) | Error::Timeout
        )
    }

    /// Errors that mean the caller's routing is stale
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            Error::NotPrimary { .. } | Error::RoutingMismatch { .. } | Error::StaleEpoch { .. }
        )
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Error::Unavailable {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unavailable { .. } => "unavailable",
            Error::NotPrimary { .. } => "not_primary",
            Error::Conflict { .. } => "conflict",
            Error::PartialFailure { .. } => "partial_failure",
            Error::RoutingMismatch { .. } => "routing_mismatch",
            Error::LeaseDenied { .. } => "lease_denied",
            Error::LeaseExpired { .. } => "lease_expired",
            Error::StaleEpoch { .. } => "stale_epoch",
            Error::SnapshotRequired { .. } => "snapshot_required",
            Error::ShardNotFound(_) => "shard_not_found",
            Error::NodeNotFound(_) => "node_not_found",
            Error::Transport(_) => "transport",
            Error::Timeout => "timeout",
            Error::Cancelled => "cancelled",
            Error::InvalidRequest(_) => "invalid_request",
            Error::CorruptSegment(_) => "corrupt_segment",
            Error::WalFull => "wal_full",
            Error::Arrow(_)
            | Error::Parquet(_)
            | Error::ObjectStore(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => "internal",
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unavailable { reason } => write!(f, "Unavailable: {}", reason),
            Error::NotPrimary {
                shard,
                node,
                primary_hint,
            } => write!(
                f,
                "Node {} is not primary for shard group {} (primary hint: {})",
                node,
                shard,
                primary_hint.as_deref().unwrap_or("unknown")
            ),
            Error::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Conflict on {}: expected version {}, found {}",
                key, expected, actual
            ),
            Error::PartialFailure { failures } => {
                let shards: Vec<String> = failures.iter().map(|s| s.shard.to_string()).collect();
                write!(f, "Partial failure on shard groups [{}]", shards.join(", "))
            }
            Error::RoutingMismatch {
                shard,
                caller_version,
                current_version,
            } => write!(
                f,
                "Routing mismatch on shard group {}: caller map v{}, current map v{}",
                shard, caller_version, current_version
            ),
            Error::LeaseDenied {
                resource,
                holder,
                expires_at_ms,
            } => write!(
                f,
                "Lease on {} denied: held by {} until {}",
                resource, holder, expires_at_ms
            ),
            Error::LeaseExpired { resource } => write!(f, "Lease on {} expired", resource),
            Error::StaleEpoch {
                shard,
                current,
                received,
            } => write!(
                f,
                "Stale epoch for shard group {}: current {}, received {}",
                shard, current, received
            ),
            Error::SnapshotRequired { shard, oldest_seq } => write!(
                f,
                "Shard group {} log starts at seq {}; snapshot required",
                shard, oldest_seq
            ),
            Error::ShardNotFound(shard) => write!(f, "Shard group not found: {}", shard),
            Error::NodeNotFound(node) => write!(f, "Node not found: {}", node),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::CorruptSegment(msg) => write!(f, "Corrupt segment: {}", msg),
            Error::WalFull => write!(f, "WAL device is full"),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e.to_string())
        }
    }
}

/// Serialized form of an [`Error`] carried in HTTP response bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub shard: Option<u32>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub expected: Option<u64>,
    #[serde(default)]
    pub actual: Option<u64>,
    #[serde(default)]
    pub failures: Vec<ShardFailure>,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        let mut body = ErrorBody {
            kind: e.kind().to_string(),
            message: e.to_string(),
            shard: None,
            seq: None,
            node: None,
            holder: None,
            key: None,
            expected: None,
            actual: None,
            failures: Vec::new(),
        };
        match e {
            Error::Unavailable { reason } => body.message = reason.clone(),
            Error::NotPrimary {
                shard,
                node,
                primary_hint,
            } => {
                body.shard = Some(*shard);
                body.node = Some(node.clone());
                body.holder = primary_hint.clone();
            }
            Error::Conflict {
                key,
                expected,
                actual,
            } => {
                body.key = Some(key.clone());
                body.expected = Some(*expected);
                body.actual = Some(*actual);
            }
            Error::PartialFailure { failures } => body.failures = failures.clone(),
            Error::RoutingMismatch {
                shard,
                caller_version,
                current_version,
            } => {
                body.shard = Some(*shard);
                body.expected = Some(*caller_version);
                body.actual = Some(*current_version);
            }
            Error::LeaseDenied {
                resource,
                holder,
                expires_at_ms,
            } => {
                body.key = Some(resource.clone());
                body.holder = Some(holder.clone());
                body.actual = Some(*expires_at_ms as u64);
            }
            Error::LeaseExpired { resource } => body.key = Some(resource.clone()),
            Error::StaleEpoch {
                shard,
                current,
                received,
            } => {
                body.shard = Some(*shard);
                body.expected = Some(*current);
                body.actual = Some(*received);
            }
            Error::SnapshotRequired { shard, oldest_seq } => {
                body.shard = Some(*shard);
                body.seq = Some(*oldest_seq);
            }
            Error::ShardNotFound(shard) => body.shard = Some(*shard),
            Error::NodeNotFound(node) => body.node = Some(node.clone()),
            Error::InvalidRequest(msg)
            | Error::CorruptSegment(msg)
            | Error::Transport(msg) => body.message = msg.clone(),
            _ => {}
        }
        body
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        let shard = body.shard.unwrap_or_default();
        match body.kind.as_str() {
            "unavailable" => Error::Unavailable {
                reason: body.message,
            },
            "not_primary" => Error::NotPrimary {
                shard,
                node: body.node.unwrap_or_default(),
                primary_hint: body.holder,
            },
            "conflict" => Error::Conflict {
                key: body.key.unwrap_or_default(),
                expected: body.expected.unwrap_or_default(),
                actual: body.actual.unwrap_or_default(),
            },
            "partial_failure" => Error::PartialFailure {
                failures: body.failures,
            },
            "routing_mismatch" => Error::RoutingMismatch {
                shard,
                caller_version: body.expected.unwrap_or_default(),
                current_version: body.actual.unwrap_or_default(),
            },
            "lease_denied" => Error::LeaseDenied {
                resource: body.key.unwrap_or_default(),
                holder: body.holder.unwrap_or_default(),
                expires_at_ms: body.actual.unwrap_or_default() as i64,
            },
            "lease_expired" => Error::LeaseExpired {
                resource: body.key.unwrap_or_default(),
            },
            "stale_epoch" => Error::StaleEpoch {
                shard,
                current: body.expected.unwrap_or_default(),
                received: body.actual.unwrap_or_default(),
            },
            "snapshot_required" => Error::SnapshotRequired {
                shard,
                oldest_seq: body.seq.unwrap_or_default(),
            },
            "shard_not_found" => Error::ShardNotFound(shard),
            "node_not_found" => Error::NodeNotFound(body.node.unwrap_or_default()),
            "transport" => Error::Transport(body.message),
            "timeout" => Error::Timeout,
            "cancelled" => Error::Cancelled,
            "invalid_request" => Error::InvalidRequest(body.message),
            "corrupt_segment" => Error::CorruptSegment(body.message),
            "wal_full" => Error::WalFull,
            _ => Error::Internal(body.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::unavailable("no quorum").is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Conflict {
            key: "k".into(),
            expected: 1,
            actual: 2
        }
        .is_transient());
    }

    #[test]
    fn test_error_body_preserves_variant() {
        let original = Error::NotPrimary {
            shard: 1,
            node: "node-1-1".into(),
            primary_hint: Some("node-1-0".into()),
        };
        let body = ErrorBody::from(&original);
        let json = serde_json::to_string(&body).unwrap();
        let decoded: ErrorBody = serde_json::from_str(&json).unwrap();

        match Error::from(decoded) {
            Error::NotPrimary {
                shard,
                node,
                primary_hint,
            } => {
                assert_eq!(shard, 1);
                assert_eq!(node, "node-1-1");
                assert_eq!(primary_hint.as_deref(), Some("node-1-0"));
            }
            other => panic!("expected NotPrimary, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_maps_to_internal() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"kind":"brand_new","message":"later release"}"#).unwrap();
        assert!(matches!(Error::from(body), Error::Internal(msg) if msg == "later release"));
    }
}
