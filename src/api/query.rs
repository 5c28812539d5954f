//! Query API

use super::wire::{ApiResult, Wire};
use super::ApiState;
use crate::query::{Predicate, QueryRequest, QueryResponse};
use axum::extract::State;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// `POST /api/v1/query`
///
/// Dropping the request (client gone, server timeout) cancels every
/// in-flight shard sub-query.
pub async fn query(
    State(state): State<ApiState>,
    Wire(request): Wire<QueryRequest>,
) -> ApiResult<QueryResponse> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response = state
        .cluster
        .coordinator()
        .query_with_cancel(request, cancel)
        .await?;
    Ok(Wire(response))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountRequest {
    #[serde(default)]
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// `POST /api/v1/query/count`: strict row count for post-load verification
pub async fn count(
    State(state): State<ApiState>,
    Wire(request): Wire<CountRequest>,
) -> ApiResult<CountResponse> {
    let count = state.cluster.coordinator().count(request.predicate).await?;
    Ok(Wire(CountResponse { count }))
}
