//! Metrics for the scatter-gather query path

use super::{ConsistencyMode, QueryResponse};
use crate::{Error, Result, ShardGroupId};

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;

struct Instruments {
    completed: Counter<u64>,
    latency: Histogram<f64>,
    result_size: Histogram<u64>,
    missing_shards: Counter<u64>,
    partials: Counter<u64>,
}

fn instruments() -> &'static Instruments {
    static CELL: OnceLock<Instruments> = OnceLock::new();
    CELL.get_or_init(|| {
        let meter = global::meter("shardhouse.query");
        Instruments {
            completed: meter
                .u64_counter("shardhouse.query.completed")
                .with_description("Queries finished, by outcome and consistency mode")
                .init(),
            latency: meter
                .f64_histogram("shardhouse.query.latency")
                .with_unit("s")
                .init(),
            result_size: meter
                .u64_histogram("shardhouse.query.result_size")
                .with_description("Rows plus aggregate groups in one response")
                .init(),
            missing_shards: meter
                .u64_counter("shardhouse.query.missing_shards")
                .with_description("Shard groups left out of best-effort answers")
                .init(),
            partials: meter
                .u64_counter("shardhouse.query.partials")
                .with_description("Per-group partial queries, by result")
                .init(),
        }
    })
}

/// Started when a query arrives, finished with its result
pub(super) struct QueryTimer {
    mode: ConsistencyMode,
    started: Instant,
}

impl QueryTimer {
    pub(super) fn start(mode: ConsistencyMode) -> Self {
        Self {
            mode,
            started: Instant::now(),
        }
    }

    pub(super) fn finish(self, result: &Result<QueryResponse>) {
        let mode = match self.mode {
            ConsistencyMode::Strict => "strict",
            ConsistencyMode::BestEffort => "best_effort",
        };
        let mut attrs = vec![KeyValue::new("mode", mode)];
        let metrics = instruments();
        match result {
            Ok(response) => {
                let missing = response
                    .incomplete
                    .as_ref()
                    .map_or(0, |i| i.missing_shards.len() as u64);
                attrs.push(KeyValue::new(
                    "outcome",
                    if missing == 0 { "complete" } else { "incomplete" },
                ));
                metrics
                    .result_size
                    .record((response.rows.len() + response.groups.len()) as u64, &attrs);
                if missing > 0 {
                    metrics.missing_shards.add(missing, &attrs);
                }
            }
            Err(e) => {
                attrs.push(KeyValue::new("outcome", "error"));
                attrs.push(KeyValue::new("error.kind", e.kind()));
            }
        }
        metrics.completed.add(1, &attrs);
        metrics
            .latency
            .record(self.started.elapsed().as_secs_f64(), &attrs);
    }
}

pub(super) fn partial_answered(shard: ShardGroupId, outcome: std::result::Result<(), &Error>) {
    let result = match outcome {
        Ok(()) => "ok",
        Err(e) => e.kind(),
    };
    instruments().partials.add(
        1,
        &[
            KeyValue::new("shard", i64::from(shard)),
            KeyValue::new("result", result),
        ],
    );
}
