//! Scatter-gather queries through the coordinator

mod common;

use shardhouse::ingest::IngestRequest;
use shardhouse::query::{
    Aggregation, CmpOp, ConsistencyMode, GroupBy, Predicate, QueryRequest, SortField,
};
use shardhouse::Error;
use std::collections::BTreeSet;

async fn loaded(shard_groups: u32, replicas: usize) -> common::TestCluster {
    let cluster = common::start(shard_groups, replicas).await;
    cluster
        .gateway()
        .ingest(IngestRequest::new("load-a", common::rows("a", 50)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    cluster
        .gateway()
        .ingest(IngestRequest::new("load-b", common::rows("b", 10)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    cluster
}

fn keys(response: &shardhouse::query::QueryResponse) -> Vec<String> {
    response.rows.iter().map(|r| r.row.row.key.clone()).collect()
}

#[tokio::test]
async fn test_query_returns_exactly_the_ingested_rows() {
    let cluster = loaded(3, 2).await;
    let response = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::All))
        .await
        .unwrap();

    assert!(response.complete);
    assert!(response.incomplete.is_none());
    assert!(response.next_token.is_none());
    let mut expected: Vec<String> = common::rows("a", 50)
        .into_iter()
        .chain(common::rows("b", 10))
        .map(|r| r.key)
        .collect();
    expected.sort();
    assert_eq!(keys(&response), expected);
    // Rows come back tagged with the group the router sends their key to.
    for row in &response.rows {
        assert_eq!(cluster.router().route(&row.row.row.key).unwrap(), row.shard);
    }
}

#[tokio::test]
async fn test_predicates_filter_rows() {
    let cluster = loaded(3, 1).await;
    let coordinator = cluster.coordinator();

    let one = coordinator
        .query(QueryRequest::rows(Predicate::key_eq("a-0007")))
        .await
        .unwrap();
    assert_eq!(keys(&one), vec!["a-0007".to_string()]);
    assert_eq!(one.rows[0].row.row.value, Some(7.0));

    let range = coordinator
        .query(QueryRequest::rows(Predicate::KeyRange {
            start: Some("a-0010".into()),
            end: Some("a-0015".into()),
        }))
        .await
        .unwrap();
    assert_eq!(keys(&range), vec!["a-0010", "a-0011", "a-0012", "a-0013", "a-0014"]);

    let high_a = Predicate::and(vec![
        Predicate::SourceEq { source: "a".into() },
        Predicate::ValueCmp {
            cmp: CmpOp::Ge,
            value: 45.0,
        },
    ]);
    assert_eq!(coordinator.count(high_a).await.unwrap(), 5);

    let in_time = Predicate::TimeRange {
        start: Some(common::BASE_TS),
        end: Some(common::BASE_TS + 3_000),
    };
    // Three timestamps, each shared by one "a" row and one "b" row.
    assert_eq!(coordinator.count(in_time).await.unwrap(), 6);

    let not_b = Predicate::Not {
        predicate: Box::new(Predicate::Or {
            predicates: vec![
                Predicate::SourceEq { source: "b".into() },
                Predicate::KeyIn {
                    keys: vec!["a-0000".into(), "a-0001".into()],
                },
            ],
        }),
    };
    assert_eq!(coordinator.count(not_b).await.unwrap(), 48);
}

#[tokio::test]
async fn test_aggregates_merge_across_groups() {
    let cluster = loaded(4, 1).await;
    let only_a = Predicate::SourceEq { source: "a".into() };
    let run = |aggregation| {
        let coordinator = cluster.coordinator().clone();
        let predicate = only_a.clone();
        async move {
            let response = coordinator
                .query(QueryRequest::aggregate(predicate, aggregation))
                .await
                .unwrap();
            assert_eq!(response.groups.len(), 1);
            response.groups[0].clone()
        }
    };

    assert_eq!(run(Aggregation::Count).await.value, Some(50.0));
    assert_eq!(run(Aggregation::Sum).await.value, Some(1225.0));
    assert_eq!(run(Aggregation::Min).await.value, Some(0.0));
    assert_eq!(run(Aggregation::Max).await.value, Some(49.0));
    let avg = run(Aggregation::Avg).await;
    assert_eq!(avg.value, Some(24.5));
    assert_eq!(avg.count, 50);
}

#[tokio::test]
async fn test_aggregate_over_no_rows() {
    let cluster = loaded(2, 1).await;
    let response = cluster
        .coordinator()
        .query(QueryRequest::aggregate(
            Predicate::SourceEq {
                source: "missing".into(),
            },
            Aggregation::Sum,
        ))
        .await
        .unwrap();
    assert_eq!(response.groups.len(), 1);
    assert_eq!(response.groups[0].value, None);
    assert_eq!(response.groups[0].count, 0);
}

#[tokio::test]
async fn test_group_by_source() {
    let cluster = loaded(3, 1).await;
    let response = cluster
        .coordinator()
        .query(
            QueryRequest::aggregate(Predicate::All, Aggregation::Count)
                .with_group_by(GroupBy::Source),
        )
        .await
        .unwrap();
    let groups: Vec<(String, u64)> = response
        .groups
        .iter()
        .map(|g| (g.group.clone(), g.count))
        .collect();
    assert_eq!(groups, vec![("a".to_string(), 50), ("b".to_string(), 10)]);
}

#[tokio::test]
async fn test_order_by_value_descending() {
    let cluster = loaded(3, 1).await;
    let response = cluster
        .coordinator()
        .query(
            QueryRequest::rows(Predicate::SourceEq { source: "a".into() })
                .with_order(SortField::Value, true)
                .with_limit(5),
        )
        .await
        .unwrap();
    let values: Vec<f64> = response
        .rows
        .iter()
        .map(|r| r.row.row.value.unwrap())
        .collect();
    assert_eq!(values, vec![49.0, 48.0, 47.0, 46.0, 45.0]);
    assert!(response.next_token.is_some());
}

#[tokio::test]
async fn test_paging_visits_every_row_once() {
    let cluster = loaded(3, 2).await;
    let mut seen = Vec::new();
    let mut request = QueryRequest::rows(Predicate::All).with_limit(7);
    let mut pages = 0;
    loop {
        let page = cluster.coordinator().query(request.clone()).await.unwrap();
        assert!(page.rows.len() <= 7);
        seen.extend(keys(&page));
        pages += 1;
        match page.next_token {
            Some(token) => request.token = Some(token),
            None => break,
        }
        assert!(pages < 20, "paging did not terminate");
    }

    assert_eq!(seen.len(), 60);
    let distinct: BTreeSet<&String> = seen.iter().collect();
    assert_eq!(distinct.len(), 60);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
}

#[tokio::test]
async fn test_strict_query_fails_when_a_group_is_down() {
    let cluster = loaded(2, 2).await;
    let primary = cluster.primary_of(1).await.unwrap().unwrap();
    cluster.crash_node(&primary).unwrap();

    let err = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::All))
        .await
        .unwrap_err();
    match err {
        Error::PartialFailure { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].shard, 1);
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_best_effort_query_reports_missing_groups() {
    let cluster = loaded(2, 2).await;
    let primary = cluster.primary_of(1).await.unwrap().unwrap();
    cluster.crash_node(&primary).unwrap();

    let response = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::All).with_mode(ConsistencyMode::BestEffort))
        .await
        .unwrap();
    assert!(!response.complete);
    let incomplete = response.incomplete.unwrap();
    assert_eq!(incomplete.missing_shards, vec![1]);
    assert_eq!(incomplete.failures.len(), 1);
    assert!(!response.rows.is_empty());
    assert!(response.rows.iter().all(|r| r.shard == 0));
}

#[tokio::test]
async fn test_stale_reads_fall_back_to_a_secondary() {
    let cluster = loaded(2, 2).await;
    // Let the secondaries learn the commit point first.
    cluster.tick().await;
    let primary = cluster.primary_of(1).await.unwrap().unwrap();
    cluster.crash_node(&primary).unwrap();

    let mut request = QueryRequest::rows(Predicate::All);
    request.stale_reads = Some(true);
    let response = cluster.coordinator().query(request).await.unwrap();
    assert!(response.complete);
    assert_eq!(response.rows.len(), 60);
}

#[tokio::test]
async fn test_query_with_every_group_down_is_unavailable() {
    let cluster = loaded(1, 1).await;
    cluster.crash_node("node-0-0").unwrap();
    let err = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::All))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_invalid_queries_are_rejected() {
    let cluster = loaded(1, 1).await;
    let zero_limit = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::All).with_limit(0))
        .await;
    assert!(matches!(zero_limit, Err(Error::InvalidRequest(_))));

    let nan = cluster
        .coordinator()
        .query(QueryRequest::rows(Predicate::ValueCmp {
            cmp: CmpOp::Gt,
            value: f64::NAN,
        }))
        .await;
    assert!(matches!(nan, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn test_reingested_batch_is_counted_once() {
    let cluster = loaded(3, 2).await;
    let again = cluster
        .gateway()
        .ingest(IngestRequest::new("load-a", common::rows("a", 50)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(again.committed_rows(), 50);
    assert_eq!(cluster.coordinator().count(Predicate::All).await.unwrap(), 60);
}
