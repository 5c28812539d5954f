//! Ingestion API

use super::wire::{ApiError, Wire};
use super::ApiState;
use crate::ingest::{IngestRequest, IngestStatus};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// `POST /api/v1/ingest`
///
/// Answers 200 when every row committed, 207 with per-row acks when only
/// some shard groups took their rows, and 503 when none did.
pub async fn ingest(
    State(state): State<ApiState>,
    Wire(request): Wire<IngestRequest>,
) -> Result<Response, ApiError> {
    let response = state.cluster.gateway().ingest(request).await?;
    let status = match response.status {
        IngestStatus::Committed => StatusCode::OK,
        IngestStatus::Partial => StatusCode::MULTI_STATUS,
        IngestStatus::Failed => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Wire(response)).into_response())
}
