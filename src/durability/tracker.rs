//! Durability Tracker
//!
//! Wraps invocation strategies and member invokers so their lifecycle is
//! recorded through the state manager before and after dispatch.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Instant;
use async_trait::async_trait;

use super::{
    DurabilityEvent, DurabilityLevel, InvocationEvent, InvokerEvent, InvokerOutcome, Phase,
    TransactionId,
};
use crate::cluster::DatabaseCluster;
use crate::error::{ExceptionFactory, Result};
use crate::invocation::{InvocationStrategy, Invoker, Results};
use crate::member::Member;
use crate::state::StateManager;

/// Default number of invocations tracked in memory at once
pub const DEFAULT_IN_FLIGHT_CAPACITY: usize = 4096;

/// Open invocations, evicted when the matching after-event is recorded.
///
/// Bounded: on overflow the oldest entry is dropped. Persisted state is
/// unaffected by eviction; only the in-memory view is lost.
struct InFlightCache {
    entries: HashMap<DurabilityEvent, Instant>,
    order: VecDeque<DurabilityEvent>,
    capacity: usize,
}

impl InFlightCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, event: DurabilityEvent) {
        if self.entries.contains_key(&event) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.entries.remove(&oldest).is_some() {
                        tracing::warn!("In-flight cache full, evicting {}", oldest);
                    }
                }
                None => break,
            }
        }
        self.entries.insert(event, Instant::now());
        self.order.push_back(event);
    }

    fn remove(&mut self, event: &DurabilityEvent) -> Option<Instant> {
        let started = self.entries.remove(event);
        if started.is_some() {
            self.order.retain(|e| e != event);
        }
        started
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Records durability events for one cluster
pub struct DurabilityTracker {
    level: DurabilityLevel,
    pub(super) state: Arc<dyn StateManager>,
    in_flight: Mutex<InFlightCache>,
}

impl DurabilityTracker {
    pub fn new(level: DurabilityLevel, state: Arc<dyn StateManager>, capacity: usize) -> Self {
        Self {
            level,
            state,
            in_flight: Mutex::new(InFlightCache::new(capacity)),
        }
    }

    pub fn level(&self) -> DurabilityLevel {
        self.level
    }

    /// Number of invocations currently open
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Wrap a strategy so the whole dispatch is bracketed by an invocation event
    pub fn strategy(
        &self,
        strategy: InvocationStrategy,
        phase: Phase,
        transaction_id: TransactionId,
    ) -> DurableStrategy<'_> {
        DurableStrategy {
            tracker: self,
            strategy,
            phase,
            transaction_id,
        }
    }

    /// Wrap a member invoker so each call is bracketed by an invoker event.
    ///
    /// Only the fine level tracks member calls; other levels return the
    /// invoker unchanged.
    pub fn invoker<R: Send + 'static>(
        &self,
        invoker: Arc<dyn Invoker<R>>,
        phase: Phase,
        transaction_id: TransactionId,
        exceptions: Arc<dyn ExceptionFactory>,
    ) -> Arc<dyn Invoker<R>> {
        if !self.level.tracks_invokers() {
            return invoker;
        }
        Arc::new(DurableInvoker {
            invoker,
            event: DurabilityEvent::new(transaction_id, phase),
            exceptions,
            state: Arc::clone(&self.state),
        })
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.state.before_invocation(event).await?;
        self.in_flight.lock().insert(event.event);
        tracing::trace!("Opened {}", event.event);
        Ok(())
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        if let Some(started) = self.in_flight.lock().remove(&event.event) {
            tracing::trace!("Closed {} after {:?}", event.event, started.elapsed());
        }
        self.state.after_invocation(event).await
    }
}

/// A strategy bracketed by an invocation event
pub struct DurableStrategy<'a> {
    tracker: &'a DurabilityTracker,
    strategy: InvocationStrategy,
    phase: Phase,
    transaction_id: TransactionId,
}

impl DurableStrategy<'_> {
    /// Dispatch through the wrapped strategy.
    ///
    /// The after-event is recorded whether or not the dispatch succeeded. If
    /// the before-event cannot be persisted nothing is dispatched.
    pub async fn invoke<R>(
        &self,
        cluster: &DatabaseCluster,
        invoker: Arc<dyn Invoker<R>>,
    ) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        if !self.tracker.level.tracks_invocations() {
            return self.strategy.invoke(cluster, invoker).await;
        }

        let event = InvocationEvent::new(
            self.transaction_id,
            self.phase,
            cluster.exception_factory().id(),
        );
        self.tracker.before_invocation(&event).await?;

        let result = self.strategy.invoke(cluster, invoker).await;
        let closed = self.tracker.after_invocation(&event).await;

        match (result, closed) {
            (Ok(results), Ok(())) => Ok(results),
            (Ok(_), Err(e)) => {
                tracing::error!("Completed {} but could not record it: {}", event.event, e);
                Err(e)
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::error!("Could not record end of {}: {}", event.event, close_err);
                }
                Err(e)
            }
        }
    }
}

/// A member invoker bracketed by invoker events
pub struct DurableInvoker<R> {
    invoker: Arc<dyn Invoker<R>>,
    event: DurabilityEvent,
    exceptions: Arc<dyn ExceptionFactory>,
    state: Arc<dyn StateManager>,
}

#[async_trait]
impl<R: Send + 'static> Invoker<R> for DurableInvoker<R> {
    async fn invoke(&self, member: &Member) -> Result<R> {
        let mut record = InvokerEvent::new(self.event, &member.id);
        self.state.before_invoker(&record).await?;

        let result = self.invoker.invoke(member).await;

        record.outcome = Some(match &result {
            Ok(_) => InvokerOutcome::Success,
            Err(e) => InvokerOutcome::Failure(self.exceptions.classify(e)),
        });
        self.state.after_invoker(&record).await?;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DefaultExceptionFactory, Error, ErrorKind};
    use crate::invocation::invoker_fn;
    use crate::state::SqliteStateManager;
    use futures::FutureExt;

    fn cluster(level: DurabilityLevel, state: Arc<SqliteStateManager>) -> DatabaseCluster {
        DatabaseCluster::builder("test")
            .member(Member::new("db1", "").with_weight(2))
            .member(Member::new("db2", "").with_weight(1))
            .state_manager(state)
            .durability(level)
            .build()
            .unwrap()
    }

    #[test]
    fn test_in_flight_cache_is_bounded() {
        let mut cache = InFlightCache::new(2);
        let events: Vec<_> = (0..3)
            .map(|_| DurabilityEvent::new(TransactionId::generate(), Phase::Invoke))
            .collect();
        for event in &events {
            cache.insert(*event);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.remove(&events[0]).is_none());
        assert!(cache.remove(&events[2]).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invocation_events_are_closed() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let cluster = cluster(DurabilityLevel::Coarse, Arc::clone(&state));
        cluster.start().await.unwrap();

        let tracker = cluster.durability();
        let tx = TransactionId::generate();
        let invoker = invoker_fn(|_member: Member| async { Ok(1u8) }.boxed());
        let results = tracker
            .strategy(InvocationStrategy::Parallel, Phase::Commit, tx)
            .invoke(&cluster, invoker)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(tracker.in_flight(), 0);
        assert!(state.unresolved_invocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_closed_on_failure() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let cluster = cluster(DurabilityLevel::Coarse, Arc::clone(&state));
        cluster.start().await.unwrap();

        let invoker = invoker_fn(|_member: Member| {
            async { Err::<u8, _>(Error::QueryExecution("syntax".into())) }.boxed()
        });
        let result = cluster
            .durability()
            .strategy(InvocationStrategy::Parallel, Phase::Invoke, TransactionId::generate())
            .invoke(&cluster, invoker)
            .await;

        assert!(result.is_err());
        assert!(state.unresolved_invocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fine_level_records_member_outcomes() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let tracker = DurabilityTracker::new(DurabilityLevel::Fine, state.clone(), 16);
        let tx = TransactionId::generate();
        let event = DurabilityEvent::new(tx, Phase::Commit);

        // Open the invocation by hand so the invoker events remain visible
        state
            .before_invocation(&InvocationEvent::new(tx, Phase::Commit, "default"))
            .await
            .unwrap();

        let invoker = invoker_fn(|member: Member| {
            async move {
                if member.id == "db2" {
                    Err(Error::member(&member.id, "gone"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        let wrapped = tracker.invoker(invoker, Phase::Commit, tx, Arc::new(DefaultExceptionFactory));

        wrapped.invoke(&Member::new("db1", "")).await.unwrap();
        assert!(wrapped.invoke(&Member::new("db2", "")).await.is_err());

        let mut events = state.invoker_events(&event).await.unwrap();
        events.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, Some(InvokerOutcome::Success));
        assert_eq!(
            events[1].outcome,
            Some(InvokerOutcome::Failure(ErrorKind::MemberFailure))
        );
    }

    #[tokio::test]
    async fn test_coarse_level_does_not_wrap_invokers() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let tracker = DurabilityTracker::new(DurabilityLevel::Coarse, state.clone(), 16);
        let tx = TransactionId::generate();

        let invoker = invoker_fn(|_member: Member| async { Ok(()) }.boxed());
        let wrapped = tracker.invoker(invoker, Phase::Invoke, tx, Arc::new(DefaultExceptionFactory));
        wrapped.invoke(&Member::new("db1", "")).await.unwrap();

        let events = state
            .invoker_events(&DurabilityEvent::new(tx, Phase::Invoke))
            .await
            .unwrap();
        assert!(events.is_empty());
    }
}
