//! Primary loss, lease expiry and recovery of replicas that come back

mod common;

use shardhouse::cluster::coordination::{replica_status, ReplicaState};
use shardhouse::ingest::{IngestRequest, IngestStatus};
use shardhouse::query::Predicate;
use shardhouse::storage::WriteRecord;
use shardhouse::Error;

async fn primary_id(cluster: &common::TestCluster, shard: u32) -> String {
    cluster.primary_of(shard).await.unwrap().expect("primary elected")
}

fn primaries_in(cluster: &common::TestCluster, shard: u32) -> Vec<String> {
    cluster
        .nodes()
        .into_iter()
        .filter(|n| n.shard() == shard && n.is_primary())
        .map(|n| n.node_id().to_string())
        .collect()
}

#[tokio::test]
async fn test_secondary_takes_over_after_primary_crash() {
    let cluster = common::start(1, 2).await;
    let old = primary_id(&cluster, 0).await;

    cluster
        .gateway()
        .ingest(IngestRequest::new("before-crash", common::rows("a", 25)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let committed = cluster.node(&old).unwrap().status().committed_seq;

    cluster.crash_node(&old).unwrap();
    cluster.fail_over(3).await.unwrap();

    let new = primary_id(&cluster, 0).await;
    assert_ne!(new, old);
    assert_eq!(primaries_in(&cluster, 0), vec![new.clone()]);
    assert_eq!(cluster.router().map().group(0).unwrap().primary.as_deref(), Some(new.as_str()));

    // Every acknowledged row survived, and the log continues without a gap.
    let count = cluster.coordinator().count(Predicate::All).await.unwrap();
    assert_eq!(count, 25);
    let ack = cluster
        .router()
        .dispatch_write(
            0,
            WriteRecord {
                batch_id: "after-crash".into(),
                rows: common::rows("b", 3),
                map_version: 0,
                row_ids: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(ack.seq, committed + 1);
}

#[tokio::test]
async fn test_write_acknowledged_before_heartbeat_survives_failover() {
    let cluster = common::start(1, 2).await;
    let old = primary_id(&cluster, 0).await;

    cluster
        .gateway()
        .ingest(IngestRequest::new("unheartbeated", common::rows("h", 12)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    // The secondary persisted the entry but has not yet learned it committed.
    let secondary = cluster
        .nodes()
        .into_iter()
        .find(|n| n.node_id() != old)
        .unwrap();
    let status = secondary.status();
    assert!(status.applied_seq < status.last_seq);

    cluster.crash_node(&old).unwrap();
    cluster.fail_over(3).await.unwrap();

    assert_eq!(primary_id(&cluster, 0).await, secondary.node_id());
    assert_eq!(cluster.coordinator().count(Predicate::All).await.unwrap(), 12);
}

#[tokio::test]
async fn test_isolated_primary_steps_down_and_failed_write_is_retried() {
    let cluster = common::start(1, 2).await;
    let old = primary_id(&cluster, 0).await;
    cluster.isolate_node(&old, true).unwrap();

    // Nothing can reach the primary: the caller gets a definitive failure.
    let rows = common::rows("iso", 10);
    let response = cluster
        .gateway()
        .ingest(IngestRequest::new("during-isolation", rows.clone()))
        .await
        .unwrap();
    assert_eq!(response.status, IngestStatus::Failed);
    assert_eq!(response.failures.len(), 1);

    cluster.fail_over(3).await.unwrap();
    let new = primary_id(&cluster, 0).await;
    assert_ne!(new, old);
    // The cut-off replica lost its lease and no longer claims the group.
    assert!(!cluster.node(&old).unwrap().is_primary());
    assert_eq!(primaries_in(&cluster, 0), vec![new.clone()]);

    let retried = cluster
        .gateway()
        .ingest(IngestRequest::new("during-isolation", rows))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(retried.committed_rows(), 10);
    assert_eq!(cluster.coordinator().count(Predicate::All).await.unwrap(), 10);

    // Reconnected, the old primary rejoins as a secondary and catches up.
    cluster.isolate_node(&old, false).unwrap();
    cluster.tick().await;
    let (status, _) = replica_status(cluster.client().as_ref(), 0, &old).await.unwrap();
    assert_eq!(status.unwrap().state, ReplicaState::InSync);
    let rejoined = cluster.node(&old).unwrap().status();
    let leader = cluster.node(&new).unwrap().status();
    assert_eq!(rejoined.last_seq, leader.last_seq);
    assert!(rejoined.epoch >= leader.epoch);
}

#[tokio::test]
async fn test_crashed_node_restarts_and_rejoins() {
    let cluster = common::start(1, 2).await;
    let old = primary_id(&cluster, 0).await;
    cluster
        .gateway()
        .ingest(IngestRequest::new("first", common::rows("x", 8)))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    cluster.crash_node(&old).unwrap();
    cluster.fail_over(3).await.unwrap();
    let new = primary_id(&cluster, 0).await;
    cluster
        .gateway()
        .ingest(IngestRequest::new("second", common::rows("y", 8)))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let restarted = cluster.restart_node(&old).await.unwrap();
    assert!(!restarted.is_primary());
    cluster.tick().await;

    let (status, _) = replica_status(cluster.client().as_ref(), 0, &old).await.unwrap();
    assert_eq!(status.unwrap().state, ReplicaState::InSync);
    assert_eq!(
        restarted.status().last_seq,
        cluster.node(&new).unwrap().status().last_seq
    );
    // Starting an already running node is refused.
    assert!(matches!(
        cluster.restart_node(&new).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_no_primary_without_ensemble_majority() {
    let cluster = common::start(1, 2).await;
    assert!(cluster.ensemble().has_quorum());

    cluster.set_ensemble_member_reachable(0, false);
    cluster.set_ensemble_member_reachable(1, false);
    assert!(!cluster.ensemble().has_quorum());

    // Leases cannot be renewed or granted, so the group ends up leaderless.
    assert!(matches!(
        cluster.fail_over(2).await,
        Err(Error::Unavailable { .. })
    ));
    assert!(primaries_in(&cluster, 0).is_empty());
    let response = cluster
        .gateway()
        .ingest(IngestRequest::new("no-quorum", common::rows("q", 5)))
        .await
        .unwrap();
    assert_eq!(response.status, IngestStatus::Failed);
    assert!(matches!(
        cluster.admin().add_shard_group().await,
        Err(Error::Unavailable { .. })
    ));

    cluster.set_ensemble_member_reachable(0, true);
    cluster.set_ensemble_member_reachable(1, true);
    cluster.fail_over(3).await.unwrap();
    assert_eq!(primaries_in(&cluster, 0).len(), 1);
    let response = cluster
        .gateway()
        .ingest(IngestRequest::new("no-quorum", common::rows("q", 5)))
        .await
        .unwrap();
    assert_eq!(response.status, IngestStatus::Committed);
    assert_eq!(cluster.coordinator().count(Predicate::All).await.unwrap(), 5);
}

#[tokio::test]
async fn test_failover_in_one_group_leaves_others_untouched() {
    let cluster = common::start(3, 2).await;
    let before: Vec<String> = {
        let mut ids = Vec::new();
        for shard in 0..3 {
            ids.push(primary_id(&cluster, shard).await);
        }
        ids
    };
    cluster
        .gateway()
        .ingest(IngestRequest::new("spread", common::rows("s", 60)))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    // Healthy primaries keep renewing while the crashed one's lease runs out.
    cluster.crash_node(&before[1]).unwrap();
    let ttl = cluster.config().lease_ttl;
    let step = cluster.config().lease_renew_interval;
    let mut waited = std::time::Duration::ZERO;
    while waited <= ttl + step {
        cluster.advance_clock(step).unwrap();
        cluster.tick().await;
        waited += step;
    }

    assert_eq!(primary_id(&cluster, 0).await, before[0]);
    assert_ne!(primary_id(&cluster, 1).await, before[1]);
    assert_eq!(primary_id(&cluster, 2).await, before[2]);
    assert_eq!(cluster.coordinator().count(Predicate::All).await.unwrap(), 60);
}
