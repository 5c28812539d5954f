//! Scatter-gather query execution
//!
//! The [`QueryCoordinator`] sends a [`PartialQuery`] to every shard group in
//! parallel. Each replica filters its rows, folds aggregates locally and
//! returns a [`PartialResult`] already sorted in result order; the
//! coordinator combines the partials and k-way merges sorted rows.

pub mod aggregate;
pub mod coordinator;
pub mod merge;
pub mod predicate;
mod telemetry;

pub use aggregate::{AggState, Aggregation};
pub use coordinator::QueryCoordinator;
pub use predicate::{CmpOp, Predicate};

use crate::error::ShardFailure;
use crate::schema::StoredRow;
use crate::ShardGroupId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Query coordinator defaults
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Bounded wait for each shard group
    pub shard_timeout: Duration,
    /// Let queries fall back to secondaries when no request says otherwise
    pub stale_reads: bool,
    /// Row limit applied when a request has none
    pub default_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            shard_timeout: Duration::from_secs(5),
            stale_reads: false,
            default_limit: 10_000,
        }
    }
}

/// What happens when a shard group cannot answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Fail the whole query
    #[default]
    Strict,
    /// Answer from the remaining groups and flag the result incomplete
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Key,
    Source,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Key,
    Timestamp,
    Value,
    Source,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    #[serde(default)]
    pub field: SortField,
    #[serde(default)]
    pub descending: bool,
}

/// Sort position of the last row a page returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCursor {
    pub shard: ShardGroupId,
    pub key: String,
    pub seq: u64,
    pub ordinal: u32,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub value: Option<f64>,
}

impl From<&ResultRow> for QueryCursor {
    fn from(row: &ResultRow) -> Self {
        Self {
            shard: row.shard,
            key: row.row.row.key.clone(),
            seq: row.row.seq,
            ordinal: row.row.ordinal,
            timestamp: row.row.row.timestamp,
            source: row.row.row.source.clone(),
            value: row.row.row.value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub group_by: Option<GroupBy>,
    /// Row order; key order when absent
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub mode: ConsistencyMode,
    /// Overrides [`QueryConfig::stale_reads`]
    #[serde(default)]
    pub stale_reads: Option<bool>,
    /// Overrides [`QueryConfig::shard_timeout`]
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Resume after this position
    #[serde(default)]
    pub token: Option<QueryCursor>,
}

impl QueryRequest {
    pub fn rows(predicate: Predicate) -> Self {
        Self {
            predicate,
            ..Self::default()
        }
    }

    pub fn aggregate(predicate: Predicate, aggregation: Aggregation) -> Self {
        Self {
            predicate,
            aggregation,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ConsistencyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_order(mut self, field: SortField, descending: bool) -> Self {
        self.order_by = Some(OrderBy { field, descending });
        self
    }

    pub fn with_group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = Some(group_by);
        self
    }
}

/// A row in a query result, tagged with the group that stored it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub shard: ShardGroupId,
    #[serde(flatten)]
    pub row: StoredRow,
}

/// One finalized aggregate; `group` is empty when the query is not grouped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub group: String,
    pub value: Option<f64>,
    /// Rows that contributed
    pub count: u64,
}

/// Annotation on a best-effort result that is missing shard groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incomplete {
    pub missing_shards: Vec<ShardGroupId>,
    pub failures: Vec<ShardFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub rows: Vec<ResultRow>,
    #[serde(default)]
    pub groups: Vec<AggregateRow>,
    /// Present when more rows follow
    #[serde(default)]
    pub next_token: Option<QueryCursor>,
    /// Every shard group answered
    pub complete: bool,
    #[serde(default)]
    pub incomplete: Option<Incomplete>,
}

/// The per-shard share of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialQuery {
    pub shard: ShardGroupId,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub group_by: Option<GroupBy>,
    #[serde(default)]
    pub order_by: OrderBy,
    pub limit: usize,
    #[serde(default)]
    pub cursor: Option<QueryCursor>,
    #[serde(default)]
    pub allow_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialGroup {
    pub group: String,
    pub state: AggState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub shard: ShardGroupId,
    /// Sequence number the partial is consistent with
    pub applied_seq: u64,
    /// Sorted in `order_by` order
    #[serde(default)]
    pub rows: Vec<ResultRow>,
    /// The replica holds more matching rows past `rows`
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub groups: Vec<PartialGroup>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_request_uses_defaults() {
        let request: QueryRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.predicate, Predicate::All);
        assert_eq!(request.aggregation, Aggregation::Rows);
        assert_eq!(request.mode, ConsistencyMode::Strict);
        assert!(request.token.is_none());
    }

    #[test]
    fn test_result_row_is_flat_on_the_wire() {
        let row = ResultRow {
            shard: 1,
            row: StoredRow {
                row: crate::schema::Row::new("bmw", 5),
                seq: 3,
                ordinal: 0,
            },
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["shard"], 1);
        assert_eq!(json["key"], "bmw");
        assert_eq!(json["seq"], 3);
        let back: ResultRow = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }
}
