//! Invocations left open by a crash are resolved on the next start

use std::sync::Arc;

use wolfha::cluster::DatabaseCluster;
use wolfha::durability::{DurabilityLevel, InvocationEvent, Phase, TransactionId};
use wolfha::member::Member;
use wolfha::state::{SqliteStateManager, StateManager};

fn cluster(state: Arc<SqliteStateManager>) -> DatabaseCluster {
    DatabaseCluster::builder("orders")
        .member(Member::new("db1", "").with_weight(3))
        .member(Member::new("db2", "").with_weight(2))
        .member(Member::new("db3", "").with_weight(1))
        .state_manager(state)
        .durability(DurabilityLevel::Coarse)
        .build()
        .unwrap()
}

fn active(cluster: &DatabaseCluster) -> Vec<String> {
    cluster.balancer().snapshot().into_iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn test_coarse_recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let open = || Arc::new(SqliteStateManager::new(dir.path().to_path_buf(), "orders").unwrap());

    // A previous run died mid-commit
    let state = open();
    for phase in [Phase::Commit, Phase::Rollback] {
        let event = InvocationEvent::new(TransactionId::generate(), phase, "default");
        state.before_invocation(&event).await.unwrap();
    }
    drop(state);

    let first = cluster(open());
    let report = first.start().await.unwrap();
    assert_eq!(report.resolved.len(), 2);
    assert_eq!(report.deactivated, vec!["db2", "db3"]);
    assert_eq!(active(&first), vec!["db1"]);
    drop(first);

    // Second start: same membership, nothing left to do
    let second = cluster(open());
    let report = second.start().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(active(&second), vec!["db1"]);

    // Running the pass again in-process is also a no-op
    let report = second.durability().recover(&second).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(active(&second), vec!["db1"]);
}

#[tokio::test]
async fn test_reinserted_event_recovers_to_same_membership() {
    let state = Arc::new(SqliteStateManager::in_memory().unwrap());
    let event = InvocationEvent::new(TransactionId::generate(), Phase::Invoke, "default");
    state.before_invocation(&event).await.unwrap();

    let cluster = cluster(Arc::clone(&state));
    cluster.start().await.unwrap();
    assert_eq!(active(&cluster), vec!["db1"]);

    // The same unresolved event seen again
    state.before_invocation(&event).await.unwrap();
    let report = cluster.durability().recover(&cluster).await.unwrap();
    assert_eq!(report.resolved.len(), 1);
    assert!(report.deactivated.is_empty());
    assert_eq!(active(&cluster), vec!["db1"]);
    assert!(state.unresolved_invocations().await.unwrap().is_empty());
}
