//! Crash Recovery
//!
//! Invocation events still open at startup mean the process died between
//! dispatch and completion, so some members may have applied the operation
//! and others not.

use std::collections::HashSet;
use serde::Serialize;

use super::{DurabilityEvent, DurabilityLevel, DurabilityTracker, InvocationEvent};
use crate::cluster::DatabaseCluster;
use crate::error::Result;
use crate::member::Member;

/// What a recovery pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Events that were found open and are now resolved
    pub resolved: Vec<DurabilityEvent>,
    /// Members deactivated as a result
    pub deactivated: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.deactivated.is_empty()
    }
}

impl DurabilityTracker {
    /// Resolve every open invocation event.
    ///
    /// Coarse: every current backup is deactivated. Fine: only active members
    /// without a recorded successful completion are deactivated, falling back
    /// to the coarse action when no active member confirmed. Resolved events
    /// are removed, so a second pass over the same state is a no-op.
    pub async fn recover(&self, cluster: &DatabaseCluster) -> Result<RecoveryReport> {
        let events = self.state.unresolved_invocations().await?;
        let mut report = RecoveryReport::default();

        if events.is_empty() {
            tracing::debug!("No unresolved durability events");
            return Ok(report);
        }

        if !self.level().tracks_invocations() {
            tracing::warn!(
                "{} unresolved durability events found but durability is '{}'; members must be checked manually",
                events.len(),
                self.level()
            );
            return Ok(report);
        }

        for event in events {
            tracing::warn!(
                "Recovering unresolved {} (classified by '{}')",
                event.event,
                event.classification
            );

            let suspects = match self.level() {
                DurabilityLevel::Fine => self.unconfirmed_members(cluster, &event).await?,
                _ => cluster.balancer().backups(),
            };

            let reason = format!("unresolved {} found at startup", event.event);
            for member in suspects {
                if cluster.deactivate(&member, &reason).await? {
                    report.deactivated.push(member.id);
                }
            }

            self.state.after_invocation(&event).await?;
            report.resolved.push(event.event);
        }

        tracing::info!(
            "Recovery resolved {} events, deactivated {:?}",
            report.resolved.len(),
            report.deactivated
        );
        Ok(report)
    }

    async fn unconfirmed_members(
        &self,
        cluster: &DatabaseCluster,
        event: &InvocationEvent,
    ) -> Result<Vec<Member>> {
        let invokers = self.state.invoker_events(&event.event).await?;
        let confirmed: HashSet<&str> = invokers
            .iter()
            .filter(|e| e.completed())
            .map(|e| e.member_id.as_str())
            .collect();

        let active = cluster.balancer().snapshot();
        if !active.iter().any(|m| confirmed.contains(m.id.as_str())) {
            tracing::warn!(
                "No active member confirmed {}, assuming every backup is suspect",
                event.event
            );
            return Ok(cluster.balancer().backups());
        }

        Ok(active
            .into_iter()
            .filter(|m| !confirmed.contains(m.id.as_str()))
            .collect())
    }
}
