//! Load generator for shardhouse
//!
//! Plays the scheduler: posts row batches to the ingestion API and, once the
//! load completes, checks the committed row count through the query API.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin load-generator -- \
//!   --endpoint http://localhost:8123 \
//!   --keys 1000 \
//!   --batches 200 \
//!   --batch-size 500
//! ```
//!
//! Failed batches are resent with the same batch id, so a batch the server
//! committed before the failure is not counted twice.

use clap::Parser;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardhouse::api::query::{CountRequest, CountResponse};
use shardhouse::api::wire::{Envelope, ErrorEnvelope};
use shardhouse::ingest::{IngestRequest, IngestResponse, IngestStatus};
use shardhouse::query::Predicate;
use shardhouse::schema::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Load generator for shardhouse
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// shardhouse endpoint URL
    #[arg(long, default_value = "http://localhost:8123")]
    endpoint: String,

    /// Number of distinct shard keys
    #[arg(long, default_value = "1000")]
    keys: usize,

    /// Number of batches to send
    #[arg(long, default_value = "100")]
    batches: usize,

    /// Rows per batch
    #[arg(long, default_value = "500")]
    batch_size: usize,

    /// Batches in flight at once
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// Attempts per batch before giving up
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Source tag written on every row, used to count this run's rows
    #[arg(long)]
    source: Option<String>,

    /// Skip the post-load count check
    #[arg(long)]
    no_verify: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Default)]
struct Stats {
    rows_committed: AtomicU64,
    rows_duplicate: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    retries: AtomicU64,
}

impl Stats {
    fn record(&self, response: &IngestResponse) {
        use shardhouse::ingest::RowStatus;
        for ack in &response.acks {
            match ack.status {
                RowStatus::Committed => {
                    self.rows_committed.fetch_add(1, Ordering::Relaxed);
                }
                RowStatus::Duplicate => {
                    self.rows_duplicate.fetch_add(1, Ordering::Relaxed);
                }
                RowStatus::Failed => {}
            }
        }
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// Deterministic row generator; batch `n` always produces the same rows
struct RowGenerator {
    keys: usize,
    batch_size: usize,
    source: String,
    start_ns: i64,
}

impl RowGenerator {
    fn batch(&self, n: usize) -> Vec<Row> {
        (0..self.batch_size)
            .map(|i| {
                let ordinal = n * self.batch_size + i;
                let key = format!("key-{:06}", (ordinal * 7919) % self.keys.max(1));
                let ts = self.start_ns + ordinal as i64 * 1_000_000;
                let value = ((ordinal % 360) as f64).to_radians().sin() * 100.0;
                Row::new(key, ts)
                    .with_source(self.source.clone())
                    .with_value(value)
                    .with_payload(format!("{{\"batch\":{},\"row\":{}}}", n, i))
            })
            .collect()
    }
}

struct ApiClient {
    client: Client,
    endpoint: String,
}

impl ApiClient {
    fn new(endpoint: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: B,
    ) -> Result<(StatusCode, R), String> {
        let resp = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(&Envelope::new(body))
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("reading response failed: {}", e))?;
        if let Ok(envelope) = serde_json::from_slice::<Envelope<R>>(&bytes) {
            let body = envelope.into_body().map_err(|e| e.to_string())?;
            return Ok((status, body));
        }
        match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
            Ok(err) => Err(format!("{} ({}): {}", status, err.error.kind, err.error.message)),
            Err(_) => Err(format!("{}: {}", status, String::from_utf8_lossy(&bytes))),
        }
    }

    async fn ingest(&self, request: IngestRequest) -> Result<(StatusCode, IngestResponse), String> {
        self.post("/api/v1/ingest", request).await
    }

    async fn count(&self, predicate: Predicate) -> Result<u64, String> {
        let (_, response): (_, CountResponse) =
            self.post("/api/v1/query/count", CountRequest { predicate }).await?;
        Ok(response.count)
    }
}

async fn send_batch(
    client: &ApiClient,
    stats: &Stats,
    batch_id: String,
    rows: Vec<Row>,
    max_attempts: u32,
    verbose: bool,
) {
    for attempt in 1..=max_attempts {
        let request = IngestRequest {
            batch_id: Some(batch_id.clone()),
            rows: rows.clone(),
        };
        match client.ingest(request).await {
            Ok((_, response)) if response.status == IngestStatus::Committed => {
                stats.record(&response);
                if verbose {
                    println!("Batch {} committed ({} rows)", batch_id, response.acks.len());
                }
                return;
            }
            Ok((status, response)) => {
                if verbose {
                    eprintln!(
                        "Batch {} attempt {}: {} with {} shard failures",
                        batch_id,
                        attempt,
                        status,
                        response.failures.len()
                    );
                }
            }
            Err(e) => {
                if verbose {
                    eprintln!("Batch {} attempt {}: {}", batch_id, attempt, e);
                }
            }
        }
        stats.retries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
    }
    stats.batches_failed.fetch_add(1, Ordering::Relaxed);
    eprintln!("Batch {} failed after {} attempts", batch_id, max_attempts);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let source = args
        .source
        .clone()
        .unwrap_or_else(|| format!("load-{}", &run_id[..8]));

    println!("shardhouse load generator");
    println!("=========================");
    println!("Endpoint:      {}", args.endpoint);
    println!("Keys:          {}", args.keys);
    println!("Batches:       {}", args.batches);
    println!("Batch size:    {}", args.batch_size);
    println!("Concurrency:   {}", args.concurrency);
    println!("Source:        {}", source);
    println!();

    let client = Arc::new(ApiClient::new(args.endpoint.clone())?);
    let generator = Arc::new(RowGenerator {
        keys: args.keys,
        batch_size: args.batch_size,
        source: source.clone(),
        start_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
    });
    let stats = Arc::new(Stats::default());
    let permits = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let start_time = Instant::now();

    let mut tasks = Vec::with_capacity(args.batches);
    for n in 0..args.batches {
        let permit = permits.clone().acquire_owned().await?;
        let client = client.clone();
        let generator = generator.clone();
        let stats = stats.clone();
        let batch_id = format!("{}-{:06}", run_id, n);
        let (max_attempts, verbose) = (args.max_attempts, args.verbose);
        tasks.push(tokio::spawn(async move {
            let rows = generator.batch(n);
            send_batch(&client, &stats, batch_id, rows, max_attempts, verbose).await;
            drop(permit);
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result?;
    }

    let elapsed = start_time.elapsed();
    let committed = stats.rows_committed.load(Ordering::Relaxed);

    println!();
    println!("Load Complete");
    println!("=============");
    println!("Duration:        {:?}", elapsed);
    println!("Batches sent:    {}", stats.batches_sent.load(Ordering::Relaxed));
    println!("Batches failed:  {}", stats.batches_failed.load(Ordering::Relaxed));
    println!("Retries:         {}", stats.retries.load(Ordering::Relaxed));
    println!("Rows committed:  {}", committed);
    println!("Rows duplicate:  {}", stats.rows_duplicate.load(Ordering::Relaxed));
    println!(
        "Actual rate:     {:.2} rows/sec",
        committed as f64 / elapsed.as_secs_f64()
    );

    if args.no_verify {
        return Ok(());
    }

    let expected = (args.batches - stats.batches_failed.load(Ordering::Relaxed) as usize)
        * args.batch_size;
    let counted = client
        .count(Predicate::SourceEq { source })
        .await
        .map_err(|e| format!("count query failed: {e}"))?;
    println!("Rows counted:    {} (expected {})", counted, expected);
    if counted != expected as u64 {
        return Err(format!("row count mismatch: counted {counted}, expected {expected}").into());
    }

    Ok(())
}
