//! The HTTP surfaces end to end: ingestion, query, admin and node RPC

mod common;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardhouse::api::admin::{LeasesResponse, ShardGroupAdded};
use shardhouse::api::query::{CountRequest, CountResponse};
use shardhouse::api::wire::{Envelope, ErrorEnvelope};
use shardhouse::api::{build_http_router, ApiServerConfig};
use shardhouse::ingest::{IngestRequest, IngestResponse, IngestStatus};
use shardhouse::query::{Predicate, QueryRequest, QueryResponse};
use shardhouse::storage::{KeyRange, ReadRequest, WriteRecord};
use shardhouse::transport::{HttpTransport, NodeTransport};
use shardhouse::Error;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

struct Server {
    cluster: common::TestCluster,
    addr: SocketAddr,
    client: Client,
}

impl Server {
    async fn start(shard_groups: u32, replicas: usize) -> Self {
        let cluster = common::start(shard_groups, replicas).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_http_router(cluster.cluster.clone(), &ApiServerConfig::default());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            cluster,
            addr,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn node_addr(&self, node_id: &str) -> String {
        format!("http://{}/nodes/{}", self.addr, node_id)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: B) -> (StatusCode, R) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&Envelope::new(body))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let envelope: Envelope<R> = resp.json().await.unwrap();
        (status, envelope.into_body().unwrap())
    }

    async fn post_err<B: Serialize>(&self, path: &str, body: B) -> (StatusCode, ErrorEnvelope) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&Envelope::new(body))
            .send()
            .await
            .unwrap();
        (resp.status(), resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = Server::start(1, 1).await;
    let ping = server.client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(ping.status(), StatusCode::OK);
    assert_eq!(ping.text().await.unwrap(), "Ok.");

    let ready = server.client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    server.cluster.set_ensemble_member_reachable(0, false);
    server.cluster.set_ensemble_member_reachable(1, false);
    let ready = server.client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_ingest_then_query_over_http() {
    let server = Server::start(3, 2).await;

    let (status, response): (_, IngestResponse) = server
        .post(
            "/api/v1/ingest",
            IngestRequest::new("http-1", common::rows("web", 30)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.status, IngestStatus::Committed);
    assert_eq!(response.acks.len(), 30);

    let (status, result): (_, QueryResponse) = server
        .post(
            "/api/v1/query",
            QueryRequest::rows(Predicate::key_eq("web-0003")),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(result.complete);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].row.row.value, Some(3.0));

    let (_, count): (_, CountResponse) = server
        .post(
            "/api/v1/query/count",
            CountRequest {
                predicate: Predicate::SourceEq {
                    source: "web".into(),
                },
            },
        )
        .await;
    assert_eq!(count.count, 30);
}

#[tokio::test]
async fn test_partial_ingest_is_multi_status() {
    let server = Server::start(2, 1).await;
    let down = server.cluster.primary_of(1).await.unwrap().unwrap();
    server.cluster.crash_node(&down).unwrap();

    let (status, response): (_, IngestResponse) = server
        .post(
            "/api/v1/ingest",
            IngestRequest::new("http-partial", common::rows("p", 30)),
        )
        .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(response.status, IngestStatus::Partial);
    assert_eq!(response.failures[0].shard, 1);
}

#[tokio::test]
async fn test_errors_carry_kind_and_schema_version() {
    let server = Server::start(1, 1).await;

    let (status, err) = server
        .post_err("/api/v1/ingest", IngestRequest::new("bad:id", common::rows("e", 1)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err.schema_version, 1);
    assert_eq!(err.error.kind, "invalid_request");

    // A body from a future major version is refused.
    let resp = server
        .client
        .post(server.url("/api/v1/query"))
        .json(&serde_json::json!({ "schema_version": 2, "predicate": { "op": "all" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Fields this reader does not know are ignored.
    let resp = server
        .client
        .post(server.url("/api/v1/query/count"))
        .json(&serde_json::json!({ "schema_version": 1, "hint": "added later" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_endpoints() {
    let server = Server::start(2, 1).await;

    let leases: Envelope<LeasesResponse> = server
        .client
        .get(server.url("/api/v1/admin/leases"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(leases.body.leases.iter().filter(|l| l.live).count(), 2);

    let (status, added): (_, ShardGroupAdded) = server
        .post("/api/v1/admin/shard-groups", serde_json::json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(added.shard, 2);
    assert_eq!(added.map.groups.len(), 3);

    let resp = server
        .client
        .delete(server.url("/api/v1/admin/shard-groups/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .delete(server.url("/api/v1/admin/shard-groups/2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(server.cluster.router().map().group_ids(), vec![0, 1]);
}

#[tokio::test]
async fn test_node_rpc_through_http_transport() {
    let server = Server::start(1, 2).await;
    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let primary = server.cluster.primary_of(0).await.unwrap().unwrap();
    let secondary = server
        .cluster
        .nodes()
        .into_iter()
        .map(|n| n.node_id().to_string())
        .find(|id| *id != primary)
        .unwrap();

    let status = transport.status(&server.node_addr(&primary)).await.unwrap();
    assert_eq!(status.node_id, primary);
    assert_eq!(status.committed_seq, 0);

    let record = WriteRecord {
        batch_id: "rpc-1".into(),
        rows: common::rows("rpc", 4),
        map_version: 0,
        row_ids: Vec::new(),
    };
    let ack = transport
        .write(&server.node_addr(&primary), 0, record.clone())
        .await
        .unwrap();
    assert_eq!(ack.seq, 1);
    assert!(!ack.duplicate);

    // Error variants survive the trip through the error envelope.
    match transport.write(&server.node_addr(&secondary), 0, record).await {
        Err(Error::NotPrimary {
            shard,
            node,
            primary_hint,
        }) => {
            assert_eq!(shard, 0);
            assert_eq!(node, secondary);
            assert_eq!(primary_hint, Some(primary.clone()));
        }
        other => panic!("expected NotPrimary, got {other:?}"),
    }
    assert!(matches!(
        transport.status(&server.node_addr("node-9-9")).await,
        Err(Error::NodeNotFound(_))
    ));

    let page = transport
        .read(
            &server.node_addr(&primary),
            ReadRequest {
                shard: 0,
                key_range: KeyRange::default(),
                token: None,
                limit: 100,
                allow_stale: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 4);
}
