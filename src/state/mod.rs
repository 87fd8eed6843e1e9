//! State Management Module
//!
//! Persists member activation and open durability events so that both survive
//! a restart. Every mutating call is durable before it returns.

mod null;
mod sqlite;

pub use null::NullStateManager;
pub use sqlite::SqliteStateManager;

use std::collections::BTreeSet;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::StateConfig;
use crate::durability::{DurabilityEvent, InvocationEvent, InvokerEvent};
use crate::error::{Error, Result};
use crate::member::Member;

/// Persisted view of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub active: bool,
    /// Why the member was last deactivated
    pub reason: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Durable store for membership and durability facts
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Active members recorded by a previous run, `None` if nothing was recorded
    async fn read_active_members(&self) -> Result<Option<BTreeSet<String>>>;

    async fn activate(&self, member: &Member) -> Result<()>;

    async fn deactivate(&self, member: &Member, reason: &str) -> Result<()>;

    async fn is_active(&self, member: &Member) -> Result<bool>;

    /// Persisted record for a member
    async fn member_record(&self, member_id: &str) -> Result<Option<MemberRecord>>;

    /// Open an invocation event
    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()>;

    /// Resolve an invocation event and every invoker event beneath it
    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()>;

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()>;

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()>;

    /// Invocation events opened but never resolved
    async fn unresolved_invocations(&self) -> Result<Vec<InvocationEvent>>;

    /// Invoker events recorded under an invocation
    async fn invoker_events(&self, event: &DurabilityEvent) -> Result<Vec<InvokerEvent>>;
}

/// Open the state manager named by the configuration
pub fn open(config: &StateConfig, cluster_id: &str) -> Result<Arc<dyn StateManager>> {
    match config.backend.as_str() {
        "none" => Ok(Arc::new(NullStateManager)),
        "sqlite" => {
            let manager = SqliteStateManager::new(config.data_dir.clone(), cluster_id)?;
            Ok(Arc::new(manager))
        }
        other => Err(Error::UnknownFactory {
            kind: "state manager",
            id: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_by_id() {
        let dir = tempdir().unwrap();
        let mut config = StateConfig {
            backend: "sqlite".into(),
            data_dir: dir.path().to_path_buf(),
        };
        assert!(open(&config, "orders").is_ok());
        assert!(dir.path().join("orders.db").exists());

        config.backend = "none".into();
        assert!(open(&config, "orders").is_ok());

        config.backend = "etcd".into();
        assert!(open(&config, "orders").is_err());
    }
}
