//! Coordinator crash points around the commit record.
//!
//! Both tests drive a mutation whose coordinator kills itself mid-protocol,
//! then restart the coordinator against the same log and verify that
//! recovery lands every participant on the logged outcome.

mod common;

use common::{within, Cluster, IO_TIMEOUT};
use pact_commit::twopc::{CoordinatorDeath, ParticipantDeath};
use pact_store::client::CoordinatorClient;

#[tokio::test]
async fn crash_before_commit_log_aborts_on_restart() {
    let cluster = Cluster::new("master-die-before-commit", 2);
    let (mut master, _replicas) = cluster.spawn_all();
    let client = CoordinatorClient::new(cluster.master_addr());

    // The coordinator exits after every prepare succeeded but before the
    // commit point, so the client sees its connection drop.
    let result = within(
        "doomed put",
        client.put_test(
            "k",
            "v",
            CoordinatorDeath::BeforeLoggingCommitted,
            vec![ParticipantDeath::None; 2],
        ),
    )
    .await;
    assert!(result.is_err());
    assert!(
        master.wait_for_exit(IO_TIMEOUT),
        "master should have killed itself"
    );

    // Recovery finds only `Started` and aborts everywhere.
    let mut master = cluster.spawn_master();
    master.assert_running("after restart");

    for index in 0..cluster.replica_count {
        assert!(within("get", client.get_from("k", index)).await.is_err());
    }
    cluster.cleanup();
}

#[tokio::test]
async fn crash_after_commit_log_commits_on_restart() {
    let cluster = Cluster::new("master-die-after-commit", 2);
    let (mut master, _replicas) = cluster.spawn_all();
    let client = CoordinatorClient::new(cluster.master_addr());

    let result = within(
        "doomed put",
        client.put_test(
            "k",
            "v",
            CoordinatorDeath::AfterLoggingCommitted,
            vec![ParticipantDeath::None; 2],
        ),
    )
    .await;
    assert!(result.is_err());
    assert!(
        master.wait_for_exit(IO_TIMEOUT),
        "master should have killed itself"
    );

    // The commit point is durable, so recovery re-drives the commit before
    // the coordinator serves again.
    let mut master = cluster.spawn_master();
    master.assert_running("after restart");

    for index in 0..cluster.replica_count {
        assert_eq!(
            within("get", client.get_from("k", index))
                .await
                .expect("get"),
            "v"
        );
    }
    cluster.cleanup();
}
