//! HTTP surfaces
//!
//! - Ingestion API (`/api/v1/ingest`), consumed by the scheduler
//! - Query API (`/api/v1/query`), consumed by the BI layer
//! - Cluster administration API (`/api/v1/admin/...`)
//! - Node RPC (`/nodes/:node_id/rpc/v1/...`), used by [`HttpTransport`](crate::transport::HttpTransport)
//!
//! Every JSON body is wrapped in a versioned envelope; see [`wire`].

pub mod admin;
pub mod ingest;
pub mod node_rpc;
pub mod query;
mod telemetry;
pub mod wire;

use crate::cluster::LocalCluster;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub http_port: u16,
    /// Maximum request body size
    pub max_body_size: usize,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8123,
            max_body_size: 16 * 1024 * 1024, // 16MB
            enable_cors: true,
        }
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<LocalCluster>,
}

/// Build the HTTP API router
pub fn build_http_router(cluster: Arc<LocalCluster>, config: &ApiServerConfig) -> Router {
    use axum::extract::DefaultBodyLimit;
    use axum::middleware;
    use tower_http::cors::{Any, CorsLayer};

    let router = Router::new()
        // Health
        .route("/ping", get(ping))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))

        // Ingestion and query
        .route("/api/v1/ingest", post(ingest::ingest))
        .route("/api/v1/query", post(query::query))
        .route("/api/v1/query/count", post(query::count))

        // Administration
        .route("/api/v1/admin/cluster", get(admin::cluster))
        .route("/api/v1/admin/leases", get(admin::leases))
        .route("/api/v1/admin/shard-groups", post(admin::add_shard_group))
        .route("/api/v1/admin/shard-groups/:id", delete(admin::remove_shard_group))
        .route("/api/v1/admin/rebalance", post(admin::begin_rebalance))
        .route("/api/v1/admin/rebalance/commit", post(admin::commit_rebalance))
        .route("/api/v1/admin/rebalance/abort", post(admin::abort_rebalance))

        // Node RPC
        .nest("/nodes/:node_id/rpc/v1", node_rpc::routes())

        .with_state(ApiState { cluster })
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(middleware::from_fn(telemetry::observe_request));

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Connectivity check
async fn ping() -> &'static str {
    "Ok."
}

async fn health_check() -> &'static str {
    "OK"
}

/// Not ready while the coordination ensemble has no quorum
async fn ready_check(State(state): State<ApiState>) -> impl IntoResponse {
    if state.cluster.ensemble().has_quorum() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NO QUORUM")
    }
}
