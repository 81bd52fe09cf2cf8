//! Per-key locking on the participant: a prepared key refuses concurrent
//! transactions until its owner settles.

mod common;

use common::{within, Cluster};
use pact_commit::twopc::{ParticipantDeath, ParticipantPeer};
use pact_store::client::ParticipantClient;

#[tokio::test]
async fn prepared_key_refuses_concurrent_transactions() {
    let cluster = Cluster::new("lock-conflict", 2);
    let _replicas = cluster.spawn_replicas();
    let clients: Vec<ParticipantClient> = (0..cluster.replica_count)
        .map(|index| ParticipantClient::new(cluster.replica_addr(index)))
        .collect();

    for client in &clients {
        assert!(within(
            "prepare",
            client.try_put("k", "v1", "tx-1", ParticipantDeath::None)
        )
        .await
        .expect("prepare"));
    }

    // The key is locked on every participant; later writers must abort.
    for client in &clients {
        assert!(!within(
            "conflicting prepare",
            client.try_put("k", "v2", "tx-2", ParticipantDeath::None)
        )
        .await
        .expect("conflicting prepare"));
        assert!(
            !within("conflicting delete", client.try_del("k", "tx-3", ParticipantDeath::None))
                .await
                .expect("conflicting delete")
        );
    }

    for client in &clients {
        assert!(within("commit", client.commit("tx-1", ParticipantDeath::None))
            .await
            .expect("commit"));
        assert_eq!(within("get", client.get("k")).await.expect("get"), "v1");
    }

    // Settling the winner releases the lock; aborting the newcomer keeps
    // the committed value intact.
    for client in &clients {
        assert!(within(
            "prepare after release",
            client.try_put("k", "v3", "tx-4", ParticipantDeath::None)
        )
        .await
        .expect("prepare after release"));
        assert!(within("abort", client.abort("tx-4")).await.expect("abort"));
        assert_eq!(within("get", client.get("k")).await.expect("get"), "v1");
    }

    cluster.cleanup();
}
