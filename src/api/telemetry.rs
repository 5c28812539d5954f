//! Per-request spans and metrics for every HTTP surface

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{info_span, Instrument};

/// API a route belongs to, used as the `shardhouse.api` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Surface {
    Health,
    Ingest,
    Query,
    Admin,
    NodeRpc,
}

impl Surface {
    fn of(route: &str) -> Self {
        match route.trim_start_matches('/').split('/').collect::<Vec<_>>().as_slice() {
            ["nodes", ..] => Surface::NodeRpc,
            ["api", "v1", "admin", ..] => Surface::Admin,
            ["api", "v1", "query", ..] => Surface::Query,
            ["api", "v1", "ingest", ..] => Surface::Ingest,
            _ => Surface::Health,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Surface::Health => "health",
            Surface::Ingest => "ingest",
            Surface::Query => "query",
            Surface::Admin => "admin",
            Surface::NodeRpc => "node_rpc",
        }
    }
}

struct ApiInstruments {
    requests: Counter<u64>,
    latency: Histogram<f64>,
    in_flight: UpDownCounter<i64>,
}

fn api_instruments() -> &'static ApiInstruments {
    static CELL: OnceLock<ApiInstruments> = OnceLock::new();
    CELL.get_or_init(|| {
        let meter = global::meter("shardhouse.api");
        ApiInstruments {
            requests: meter
                .u64_counter("shardhouse.api.requests")
                .with_description("Requests answered, by surface and status class")
                .init(),
            latency: meter
                .f64_histogram("shardhouse.api.latency")
                .with_unit("s")
                .init(),
            in_flight: meter
                .i64_up_down_counter("shardhouse.api.in_flight")
                .with_description("Requests currently being served")
                .init(),
        }
    })
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Wraps a request in a server span and records it once answered
pub async fn observe_request(req: Request<Body>, next: Next) -> Response {
    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => "unmatched".to_owned(),
    };
    let surface = Surface::of(&route).as_str();
    let method = req.method().clone();
    let instruments = api_instruments();
    let in_flight = [KeyValue::new("shardhouse.api", surface)];

    instruments.in_flight.add(1, &in_flight);
    let started = Instant::now();
    let span = info_span!(
        "http.request",
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route,
        shardhouse.api = surface,
    );
    let response = next.run(req).instrument(span).await;
    instruments.in_flight.add(-1, &in_flight);

    let status = response.status();
    let attrs = [
        KeyValue::new("shardhouse.api", surface),
        KeyValue::new("http.request.method", method.as_str().to_owned()),
        KeyValue::new("http.route", route.clone()),
        KeyValue::new("http.status_class", status_class(status)),
    ];
    instruments.requests.add(1, &attrs);
    instruments
        .latency
        .record(started.elapsed().as_secs_f64(), &attrs);
    if status.is_server_error() {
        tracing::debug!(%method, %route, status = status.as_u16(), "Request failed");
    }
    response
}
