//! Storage node RPC over HTTP, the server side of
//! [`HttpTransport`](crate::transport::HttpTransport)

use super::wire::{ApiError, ApiResult, Empty, Wire};
use super::ApiState;
use crate::query::{PartialQuery, PartialResult};
use crate::storage::{
    FetchLogRequest, LogChunk, NodeStatus, ReadPage, ReadRequest, RejoinOutcome, RejoinRequest,
    ReplicateAck, ReplicateRequest, Snapshot, StorageNode, WriteAck, WriteRecord,
};
use crate::{Error, ShardGroupId};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Routes nested under `/nodes/:node_id/rpc/v1`
pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/shards/:shard/write", post(write))
        .route("/shards/:shard/snapshot", get(snapshot))
        .route("/replicate", post(replicate))
        .route("/snapshot/install", post(install_snapshot))
        .route("/read", post(read))
        .route("/query", post(query_partial))
        .route("/log", post(fetch_log))
        .route("/rejoin", post(rejoin))
}

fn node(state: &ApiState, node_id: &str) -> Result<Arc<StorageNode>, ApiError> {
    state
        .cluster
        .network()
        .node(node_id)
        .ok_or_else(|| ApiError(Error::NodeNotFound(node_id.to_string())))
}

async fn ping(State(state): State<ApiState>, Path(node_id): Path<String>) -> ApiResult<Empty> {
    node(&state, &node_id)?;
    Ok(Wire(Empty {}))
}

async fn status(State(state): State<ApiState>, Path(node_id): Path<String>) -> ApiResult<NodeStatus> {
    Ok(Wire(node(&state, &node_id)?.status()))
}

async fn write(
    State(state): State<ApiState>,
    Path((node_id, shard)): Path<(String, ShardGroupId)>,
    Wire(record): Wire<WriteRecord>,
) -> ApiResult<WriteAck> {
    Ok(Wire(node(&state, &node_id)?.write(shard, record).await?))
}

async fn snapshot(
    State(state): State<ApiState>,
    Path((node_id, shard)): Path<(String, ShardGroupId)>,
) -> ApiResult<Snapshot> {
    Ok(Wire(node(&state, &node_id)?.snapshot(shard).await?))
}

async fn replicate(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(request): Wire<ReplicateRequest>,
) -> ApiResult<ReplicateAck> {
    Ok(Wire(node(&state, &node_id)?.replicate(request).await?))
}

async fn install_snapshot(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(snapshot): Wire<Snapshot>,
) -> ApiResult<ReplicateAck> {
    Ok(Wire(node(&state, &node_id)?.install_snapshot(snapshot).await?))
}

async fn read(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(request): Wire<ReadRequest>,
) -> ApiResult<ReadPage> {
    Ok(Wire(node(&state, &node_id)?.read(request).await?))
}

async fn query_partial(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(request): Wire<PartialQuery>,
) -> ApiResult<PartialResult> {
    Ok(Wire(node(&state, &node_id)?.query_partial(request).await?))
}

async fn fetch_log(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(request): Wire<FetchLogRequest>,
) -> ApiResult<LogChunk> {
    Ok(Wire(node(&state, &node_id)?.fetch_log(request).await?))
}

async fn rejoin(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Wire(request): Wire<RejoinRequest>,
) -> ApiResult<RejoinOutcome> {
    Ok(Wire(node(&state, &node_id)?.handle_rejoin(request).await?))
}
