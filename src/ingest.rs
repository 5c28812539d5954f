//! Ingestion Gateway
//!
//! Splits an incoming batch by shard group and writes every group's rows as
//! one sub-batch through the [`Router`]. Each sub-batch carries the caller's
//! batch id and the request index of every row, and primaries deduplicate
//! per (batch id, row index). Rows of a failed sub-batch are routed again
//! under the refreshed map on the next round, so a retry after a rebalance
//! lands moved rows on their new group instead of losing them. Groups fail
//! independently: a rejected group is reported against its shard keys while
//! the others commit.

use crate::error::ShardFailure;
use crate::router::Router;
use crate::schema::{validate_rows, Row};
use crate::storage::{WriteAck, WriteRecord};
use crate::{Error, Result, ShardGroupId};
use futures::future::join_all;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Routing rounds per batch, including the first
    pub max_attempts: u32,
    /// Largest batch accepted in one request
    pub max_batch_rows: usize,
    /// Pause before the second attempt; grows linearly after that
    pub retry_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_batch_rows: 50_000,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Caller-assigned id that makes the request idempotent; generated
    /// when absent
    #[serde(default)]
    pub batch_id: Option<String>,
    pub rows: Vec<Row>,
}

impl IngestRequest {
    pub fn new(batch_id: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Committed,
    /// Committed by an earlier attempt with the same batch id
    Duplicate,
    Failed,
}

/// Outcome for one row, in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowAck {
    pub index: usize,
    pub key: String,
    pub shard: ShardGroupId,
    pub status: RowStatus,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Committed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub batch_id: String,
    pub status: IngestStatus,
    pub acks: Vec<RowAck>,
    #[serde(default)]
    pub failures: Vec<ShardFailure>,
}

impl IngestResponse {
    /// `PartialFailure` unless every row committed
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            IngestStatus::Committed => Ok(self),
            IngestStatus::Partial | IngestStatus::Failed => Err(Error::PartialFailure {
                failures: self.failures,
            }),
        }
    }

    pub fn committed_rows(&self) -> usize {
        self.acks
            .iter()
            .filter(|a| a.status != RowStatus::Failed)
            .count()
    }
}

struct SubBatch {
    shard: ShardGroupId,
    indices: Vec<usize>,
    rows: Vec<Row>,
}

pub struct IngestionGateway {
    router: Arc<Router>,
    config: IngestConfig,
}

impl IngestionGateway {
    pub fn new(router: Arc<Router>, config: IngestConfig) -> Self {
        Self { router, config }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse> {
        let start = Instant::now();
        let rows = request.rows.len();
        let batch_id = request
            .batch_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("ingest", batch_id = %batch_id, rows);

        let result = self.execute(batch_id, request.rows).instrument(span).await;
        record_ingest(&result, start.elapsed());
        result
    }

    async fn execute(&self, batch_id: String, rows: Vec<Row>) -> Result<IngestResponse> {
        validate_rows(&rows)?;
        if rows.len() > self.config.max_batch_rows.min(u32::MAX as usize) {
            return Err(Error::InvalidRequest(format!(
                "batch has {} rows, limit is {}",
                rows.len(),
                self.config.max_batch_rows
            )));
        }
        if batch_id.contains(':') {
            return Err(Error::InvalidRequest("batch_id must not contain ':'".into()));
        }

        let mut pending: Vec<(usize, Row)> = rows.into_iter().enumerate().collect();
        let mut acks = Vec::with_capacity(pending.len());
        let mut failures = Vec::new();
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let groups = self.partition(std::mem::take(&mut pending))?;
            debug!(groups = groups.len(), attempt, "Batch partitioned");

            let writes = groups
                .into_values()
                .map(|sub| self.write_sub_batch(&batch_id, sub));
            let mut refresh = false;
            for (sub, outcome) in join_all(writes).await {
                match outcome {
                    Ok(ack) => acks.extend(committed_acks(sub, &ack)),
                    Err(e) if attempt < attempts && retryable(&e) => {
                        warn!(
                            shard = sub.shard,
                            attempt,
                            rows = sub.rows.len(),
                            error = %e,
                            "Sub-batch failed, routing its rows again"
                        );
                        refresh |= e.needs_refresh();
                        pending.extend(sub.indices.into_iter().zip(sub.rows));
                    }
                    Err(e) => {
                        warn!(shard = sub.shard, attempts = attempt, error = %e, "Sub-batch rejected");
                        let (failure, failed) = failed_acks(sub, &e);
                        failures.push(failure);
                        acks.extend(failed);
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
            if refresh {
                if let Err(e) = self.router.refresh().await {
                    warn!(error = %e, "Map refresh before retry failed");
                }
            }
            tokio::time::sleep(self.config.retry_backoff * attempt).await;
        }
        acks.sort_by_key(|a| a.index);

        let status = if failures.is_empty() {
            IngestStatus::Committed
        } else if acks.iter().all(|a| a.status == RowStatus::Failed) {
            IngestStatus::Failed
        } else {
            IngestStatus::Partial
        };
        Ok(IngestResponse {
            batch_id,
            status,
            acks,
            failures,
        })
    }

    /// Group rows by the shard group the current map routes them to
    fn partition(&self, rows: Vec<(usize, Row)>) -> Result<BTreeMap<ShardGroupId, SubBatch>> {
        let mut groups: BTreeMap<ShardGroupId, SubBatch> = BTreeMap::new();
        for (index, row) in rows {
            let shard = self.router.route(&row.key)?;
            let sub = groups.entry(shard).or_insert_with(|| SubBatch {
                shard,
                indices: Vec::new(),
                rows: Vec::new(),
            });
            sub.indices.push(index);
            sub.rows.push(row);
        }
        Ok(groups)
    }

    async fn write_sub_batch(&self, batch_id: &str, sub: SubBatch) -> (SubBatch, Result<WriteAck>) {
        let record = WriteRecord {
            batch_id: batch_id.to_string(),
            rows: sub.rows.clone(),
            map_version: 0,
            row_ids: sub.indices.iter().map(|&i| i as u32).collect(),
        };
        let result = self.router.dispatch_write(sub.shard, record).await;
        (sub, result)
    }
}

fn committed_acks(sub: SubBatch, ack: &WriteAck) -> Vec<RowAck> {
    let duplicates: HashSet<usize> = ack.duplicate_rows.iter().map(|&i| i as usize).collect();
    sub.indices
        .into_iter()
        .zip(sub.rows)
        .map(|(index, row)| RowAck {
            index,
            key: row.key,
            shard: sub.shard,
            status: if ack.duplicate || duplicates.contains(&index) {
                RowStatus::Duplicate
            } else {
                RowStatus::Committed
            },
            seq: Some(ack.seq),
            error: None,
        })
        .collect()
}

fn failed_acks(sub: SubBatch, error: &Error) -> (ShardFailure, Vec<RowAck>) {
    let error = error.to_string();
    let keys: BTreeSet<&str> = sub.rows.iter().map(|r| r.key.as_str()).collect();
    let failure = ShardFailure {
        shard: sub.shard,
        keys: keys.into_iter().map(str::to_string).collect(),
        error: error.clone(),
    };
    let acks = sub
        .indices
        .into_iter()
        .zip(sub.rows)
        .map(|(index, row)| RowAck {
            index,
            key: row.key,
            shard: sub.shard,
            status: RowStatus::Failed,
            seq: None,
            error: Some(error.clone()),
        })
        .collect();
    (failure, acks)
}

fn retryable(error: &Error) -> bool {
    error.is_transient() || error.needs_refresh()
}

struct IngestInstruments {
    requests: Counter<u64>,
    rows: Counter<u64>,
    duration_seconds: Histogram<f64>,
}

fn instruments() -> &'static IngestInstruments {
    static INSTRUMENTS: OnceLock<IngestInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("shardhouse.ingest");
        IngestInstruments {
            requests: meter
                .u64_counter("shardhouse.ingest.requests")
                .with_description("Ingest requests by status")
                .init(),
            rows: meter
                .u64_counter("shardhouse.ingest.rows")
                .with_description("Ingested rows by status")
                .init(),
            duration_seconds: meter
                .f64_histogram("shardhouse.ingest.duration")
                .with_description("Ingest request latency")
                .with_unit("s")
                .init(),
        }
    })
}

fn record_ingest(result: &Result<IngestResponse>, elapsed: Duration) {
    let i = instruments();
    let status = match result {
        Ok(response) => match response.status {
            IngestStatus::Committed => "committed",
            IngestStatus::Partial => "partial",
            IngestStatus::Failed => "failed",
        },
        Err(e) => e.kind(),
    };
    let attrs = [KeyValue::new("status", status)];
    i.requests.add(1, &attrs);
    i.duration_seconds.record(elapsed.as_secs_f64(), &attrs);
    if let Ok(response) = result {
        let committed = response.committed_rows() as u64;
        let failed = response.acks.len() as u64 - committed;
        i.rows
            .add(committed, &[KeyValue::new("status", "committed")]);
        if failed > 0 {
            i.rows.add(failed, &[KeyValue::new("status", "failed")]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_batch_id_parses() {
        let request: IngestRequest =
            serde_json::from_str(r#"{"rows":[{"key":"a","timestamp":1}]}"#).unwrap();
        assert!(request.batch_id.is_none());
        assert_eq!(request.rows.len(), 1);
    }

    #[test]
    fn test_partial_response_becomes_partial_failure() {
        let response = IngestResponse {
            batch_id: "b".into(),
            status: IngestStatus::Partial,
            acks: Vec::new(),
            failures: vec![ShardFailure {
                shard: 1,
                keys: vec!["k".into()],
                error: "unavailable".into(),
            }],
        };
        match response.into_result() {
            Err(Error::PartialFailure { failures }) => assert_eq!(failures[0].shard, 1),
            other => panic!("expected PartialFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_policy() {
        assert!(retryable(&Error::Timeout));
        assert!(retryable(&Error::NotPrimary {
            shard: 0,
            node: "n".into(),
            primary_hint: None
        }));
        assert!(!retryable(&Error::InvalidRequest("bad".into())));
    }
}
