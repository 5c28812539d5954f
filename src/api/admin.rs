//! Cluster administration API

use super::wire::{ApiResult, Wire};
use super::ApiState;
use crate::cluster::admin::LeaseInfo;
use crate::cluster::{ClusterInfo, ClusterMap, PartitionKind};
use crate::ShardGroupId;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasesResponse {
    pub leases: Vec<LeaseInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardGroupAdded {
    pub shard: ShardGroupId,
    pub map: ClusterMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapResponse {
    pub map: ClusterMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceRequest {
    /// Partition function of the new map; the current one when absent
    #[serde(default)]
    pub kind: Option<PartitionKind>,
    /// Groups to spread the key space over; every group when absent
    #[serde(default)]
    pub groups: Option<Vec<ShardGroupId>>,
}

/// `GET /api/v1/admin/cluster`
pub async fn cluster(State(state): State<ApiState>) -> ApiResult<ClusterInfo> {
    Ok(Wire(state.cluster.admin().inspect().await?))
}

/// `GET /api/v1/admin/leases`
pub async fn leases(State(state): State<ApiState>) -> ApiResult<LeasesResponse> {
    let leases = state.cluster.admin().leases().await?;
    Ok(Wire(LeasesResponse { leases }))
}

/// `POST /api/v1/admin/shard-groups`: register a group and start its replicas
pub async fn add_shard_group(State(state): State<ApiState>) -> ApiResult<ShardGroupAdded> {
    let shard = state.cluster.add_shard_group().await?;
    let map = state.cluster.router().map().as_ref().clone();
    Ok(Wire(ShardGroupAdded { shard, map }))
}

/// `DELETE /api/v1/admin/shard-groups/:id`
pub async fn remove_shard_group(
    State(state): State<ApiState>,
    Path(id): Path<ShardGroupId>,
) -> ApiResult<MapResponse> {
    state.cluster.remove_shard_group(id).await?;
    let map = state.cluster.router().map().as_ref().clone();
    Ok(Wire(MapResponse { map }))
}

/// `POST /api/v1/admin/rebalance`
pub async fn begin_rebalance(
    State(state): State<ApiState>,
    Wire(request): Wire<RebalanceRequest>,
) -> ApiResult<MapResponse> {
    let map = state
        .cluster
        .admin()
        .begin_rebalance(request.kind, request.groups)
        .await?;
    Ok(Wire(MapResponse { map }))
}

/// `POST /api/v1/admin/rebalance/commit`
pub async fn commit_rebalance(State(state): State<ApiState>) -> ApiResult<MapResponse> {
    let map = state.cluster.admin().commit_rebalance().await?;
    state.cluster.router().refresh().await?;
    Ok(Wire(MapResponse { map }))
}

/// `POST /api/v1/admin/rebalance/abort`
pub async fn abort_rebalance(State(state): State<ApiState>) -> ApiResult<MapResponse> {
    let map = state.cluster.admin().abort_rebalance().await?;
    Ok(Wire(MapResponse { map }))
}
