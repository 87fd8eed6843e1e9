//! No-op state manager
//!
//! Persists nothing; every restart assumes full membership and no open
//! durability events.

use std::collections::BTreeSet;
use async_trait::async_trait;

use super::{MemberRecord, StateManager};
use crate::durability::{DurabilityEvent, InvocationEvent, InvokerEvent};
use crate::error::Result;
use crate::member::Member;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullStateManager;

#[async_trait]
impl StateManager for NullStateManager {
    async fn read_active_members(&self) -> Result<Option<BTreeSet<String>>> {
        Ok(None)
    }

    async fn activate(&self, _member: &Member) -> Result<()> {
        Ok(())
    }

    async fn deactivate(&self, _member: &Member, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn is_active(&self, _member: &Member) -> Result<bool> {
        Ok(true)
    }

    async fn member_record(&self, _member_id: &str) -> Result<Option<MemberRecord>> {
        Ok(None)
    }

    async fn before_invocation(&self, _event: &InvocationEvent) -> Result<()> {
        Ok(())
    }

    async fn after_invocation(&self, _event: &InvocationEvent) -> Result<()> {
        Ok(())
    }

    async fn before_invoker(&self, _event: &InvokerEvent) -> Result<()> {
        Ok(())
    }

    async fn after_invoker(&self, _event: &InvokerEvent) -> Result<()> {
        Ok(())
    }

    async fn unresolved_invocations(&self) -> Result<Vec<InvocationEvent>> {
        Ok(Vec::new())
    }

    async fn invoker_events(&self, _event: &DurabilityEvent) -> Result<Vec<InvokerEvent>> {
        Ok(Vec::new())
    }
}
