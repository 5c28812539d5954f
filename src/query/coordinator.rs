//! Query Coordinator
//!
//! Fans a query out to every shard group of the current cluster map, waits
//! a bounded time for each, and combines the partials. Strict queries fail
//! when any group is missing; best-effort queries answer from the groups
//! that replied and say which ones did not.

use super::aggregate::AggState;
use super::merge::k_way_merge;
use super::telemetry::{partial_answered, QueryTimer};
use super::{
    AggregateRow, Aggregation, ConsistencyMode, Incomplete, PartialQuery, PartialResult,
    Predicate, QueryConfig, QueryCursor, QueryRequest, QueryResponse,
};
use crate::error::ShardFailure;
use crate::router::Router;
use crate::{Error, Result, ShardGroupId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

pub struct QueryCoordinator {
    router: Arc<Router>,
    config: QueryConfig,
}

impl QueryCoordinator {
    pub fn new(router: Arc<Router>, config: QueryConfig) -> Self {
        Self { router, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.query_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run a query; cancelling `cancel` stops every in-flight partial
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResponse> {
        let timer = QueryTimer::start(request.mode);
        let span = info_span!(
            "query",
            aggregation = ?request.aggregation,
            mode = ?request.mode,
        );
        let result = self.execute(request, cancel).instrument(span).await;
        timer.finish(&result);
        result
    }

    /// Number of rows matching `predicate` across every shard group
    pub async fn count(&self, predicate: Predicate) -> Result<u64> {
        let response = self
            .query(QueryRequest::aggregate(predicate, Aggregation::Count))
            .await?;
        Ok(response.groups.first().map_or(0, |g| g.count))
    }

    async fn execute(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResponse> {
        request.predicate.validate()?;
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        let order = request.order_by.unwrap_or_default();
        let allow_stale = request.stale_reads.unwrap_or(self.config.stale_reads);
        let shard_timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.shard_timeout);

        let map = self.router.map();
        let shards = map.group_ids();
        debug!(shards = shards.len(), map_version = map.version, "Fanning out query");

        let subqueries = cancel.child_token();
        let mut tasks: JoinSet<(ShardGroupId, Result<PartialResult>)> = JoinSet::new();
        for shard in shards.iter().copied() {
            let partial = PartialQuery {
                shard,
                predicate: request.predicate.clone(),
                aggregation: request.aggregation,
                group_by: request.group_by,
                order_by: order,
                limit,
                cursor: request.token.clone(),
                allow_stale,
            };
            let router = Arc::clone(&self.router);
            let token = subqueries.clone();
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(Error::Cancelled),
                    result = tokio::time::timeout(
                        shard_timeout,
                        router.dispatch_partial_query(shard, partial),
                    ) => result.unwrap_or(Err(Error::Timeout)),
                };
                (shard, outcome)
            });
        }

        let mut partials = Vec::with_capacity(shards.len());
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (shard, outcome) = joined
                .map_err(|e| Error::Internal(format!("partial query task failed: {}", e)))?;
            match outcome {
                Ok(partial) => {
                    partial_answered(shard, Ok(()));
                    partials.push(partial);
                }
                Err(e) => {
                    partial_answered(shard, Err(&e));
                    warn!(shard, error = %e, "Shard group did not answer query");
                    failures.push(ShardFailure {
                        shard,
                        keys: Vec::new(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !failures.is_empty() && request.mode == ConsistencyMode::Strict {
            failures.sort_by_key(|f| f.shard);
            if partials.is_empty() {
                let reason = failures
                    .iter()
                    .map(|f| format!("shard {}: {}", f.shard, f.error))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(Error::unavailable(format!(
                    "no shard group answered: {}",
                    reason
                )));
            }
            return Err(Error::PartialFailure { failures });
        }

        let mut response = if request.aggregation.is_rows() {
            combine_rows(partials, order, limit)
        } else {
            combine_groups(partials, request.aggregation, request.group_by.is_none())
        };
        if failures.is_empty() {
            response.complete = true;
        } else {
            failures.sort_by_key(|f| f.shard);
            response.incomplete = Some(Incomplete {
                missing_shards: failures.iter().map(|f| f.shard).collect(),
                failures,
            });
        }
        Ok(response)
    }
}

fn combine_rows(partials: Vec<PartialResult>, order: super::OrderBy, limit: usize) -> QueryResponse {
    let shard_has_more = partials.iter().any(|p| p.has_more);
    let streams = partials.into_iter().map(|p| p.rows).collect();
    let (rows, left_over) = k_way_merge(streams, order, limit);
    let next_token = if left_over || shard_has_more {
        rows.last().map(QueryCursor::from)
    } else {
        None
    };
    QueryResponse {
        rows,
        next_token,
        ..QueryResponse::default()
    }
}

fn combine_groups(
    partials: Vec<PartialResult>,
    aggregation: Aggregation,
    ungrouped: bool,
) -> QueryResponse {
    let mut merged: BTreeMap<String, AggState> = BTreeMap::new();
    if ungrouped {
        merged.insert(String::new(), AggState::default());
    }
    for partial in partials {
        for group in partial.groups {
            merged.entry(group.group).or_default().merge(&group.state);
        }
    }
    QueryResponse {
        groups: merged
            .into_iter()
            .map(|(group, state)| AggregateRow {
                group,
                value: state.finalize(aggregation),
                count: state.count,
            })
            .collect(),
        ..QueryResponse::default()
    }
}
