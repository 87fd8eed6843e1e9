//! A member failing mid-operation is dropped without failing the operation

use std::sync::Arc;
use futures::FutureExt;

use wolfha::balancer::BalancerKind;
use wolfha::cluster::DatabaseCluster;
use wolfha::durability::DurabilityLevel;
use wolfha::error::Error;
use wolfha::invocation::{invoker_fn, InvocationStrategy, Invoker};
use wolfha::member::Member;
use wolfha::state::{SqliteStateManager, StateManager};

fn three_members(state: Arc<SqliteStateManager>, strategy: InvocationStrategy) -> DatabaseCluster {
    DatabaseCluster::builder("orders")
        .member(Member::new("db1", "mysql://db1/orders").with_weight(3))
        .member(Member::new("db2", "mysql://db2/orders").with_weight(2))
        .member(Member::new("db3", "mysql://db3/orders").with_weight(1))
        .balancer(BalancerKind::RoundRobin)
        .strategy(strategy)
        .state_manager(state)
        .durability(DurabilityLevel::Coarse)
        .build()
        .unwrap()
}

fn rows_affected_except(bad: &'static str) -> Arc<dyn Invoker<u64>> {
    invoker_fn(move |member: Member| {
        async move {
            if member.id == bad {
                Err(Error::ConnectionFailed {
                    address: member.id.clone(),
                    reason: "connection reset by peer".into(),
                })
            } else {
                Ok(17)
            }
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_failed_member_is_deactivated_and_recorded() {
    for strategy in [InvocationStrategy::Parallel, InvocationStrategy::Sequential] {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let cluster = three_members(Arc::clone(&state), strategy);
        cluster.start().await.unwrap();

        let results = cluster
            .execute("UPDATE orders SET shipped = 1", rows_affected_except("db3"))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|rows| *rows == 17));

        let backups: Vec<String> = cluster.balancer().backups().into_iter().map(|m| m.id).collect();
        assert_eq!(backups, vec!["db2"]);

        let record = state.member_record("db3").await.unwrap().unwrap();
        assert!(!record.active);
        assert!(record.reason.unwrap().contains("connection reset"));
        assert!(state.unresolved_invocations().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_deactivation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let state = Arc::new(SqliteStateManager::new(dir.path().to_path_buf(), "orders").unwrap());
        let cluster = three_members(state, InvocationStrategy::Parallel);
        cluster.start().await.unwrap();
        cluster
            .execute("DELETE FROM carts", rows_affected_except("db2"))
            .await
            .unwrap();
    }

    let state = Arc::new(SqliteStateManager::new(dir.path().to_path_buf(), "orders").unwrap());
    let cluster = three_members(state, InvocationStrategy::Parallel);
    cluster.start().await.unwrap();

    assert!(!cluster.is_active(&Member::new("db2", "")));
    assert_eq!(cluster.balancer().snapshot().len(), 2);
}

#[tokio::test]
async fn test_read_falls_over_to_next_member() {
    let state = Arc::new(SqliteStateManager::in_memory().unwrap());
    let cluster = three_members(Arc::clone(&state), InvocationStrategy::Parallel);
    cluster.start().await.unwrap();

    for _ in 0..6 {
        let results = cluster
            .execute("SELECT COUNT(*) FROM orders", rows_affected_except("db1"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results.contains_key("db1"));
    }
    assert!(!cluster.is_active(&Member::new("db1", "")));
    assert_eq!(cluster.balancer().primary().unwrap().id, "db2");
}
