//! Database Cluster
//!
//! Ties the configured members to a balancer, state manager, lock manager and
//! durability tracker, and exposes the operations a session issues against the
//! cluster as a whole.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

use crate::balancer::{Balancer, BalancerKind};
use crate::config::WolfHaConfig;
use crate::dialect::{Dialect, StandardDialect};
use crate::durability::{
    DurabilityLevel, DurabilityTracker, Phase, RecoveryReport, TransactionId,
    DEFAULT_IN_FLIGHT_CAPACITY,
};
use crate::error::{DefaultExceptionFactory, Error, ErrorKind, ExceptionFactory, Result};
use crate::invocation::{InvocationStrategy, Invoker, Operation, OperationKind, Results};
use crate::lock::{LocalLockManager, LockDescriptor, LockGuard, LockManager};
use crate::member::Member;
use crate::recorder::{ChildHandle, ChildProxy};
use crate::state::{self, NullStateManager, StateManager};

/// Default bound on structural lock acquisition
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A set of database members behaving as one
pub struct DatabaseCluster {
    id: String,
    members: Vec<Member>,
    balancer: Arc<dyn Balancer>,
    state: Arc<dyn StateManager>,
    locks: Arc<dyn LockManager>,
    durability: DurabilityTracker,
    dialect: Arc<dyn Dialect>,
    exceptions: Arc<dyn ExceptionFactory>,
    strategy: InvocationStrategy,
    lock_timeout: Duration,
}

impl DatabaseCluster {
    pub fn builder(id: impl Into<String>) -> DatabaseClusterBuilder {
        DatabaseClusterBuilder::new(id)
    }

    /// Builder preloaded from configuration, with the configured state store opened
    pub fn from_config(config: &WolfHaConfig) -> Result<DatabaseClusterBuilder> {
        let cluster = &config.cluster;
        let mut builder = Self::builder(&cluster.id)
            .balancer(cluster.balancer.parse()?)
            .strategy(cluster.strategy.parse()?)
            .durability(cluster.durability.parse()?)
            .lock_timeout(Duration::from_millis(cluster.lock_timeout_ms))
            .tx_cache_capacity(cluster.tx_cache_capacity)
            .state_manager(state::open(&config.state, &cluster.id)?);

        for member in &config.members {
            builder = builder.member(member.to_member());
        }
        Ok(builder)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every configured member, active or not
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn balancer(&self) -> Arc<dyn Balancer> {
        Arc::clone(&self.balancer)
    }

    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.state
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn durability(&self) -> &DurabilityTracker {
        &self.durability
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn exception_factory(&self) -> &Arc<dyn ExceptionFactory> {
        &self.exceptions
    }

    pub fn strategy(&self) -> InvocationStrategy {
        self.strategy
    }

    /// Restore membership from the state store, then recover any invocation
    /// a previous run left open.
    ///
    /// Members with no persisted record are activated; members recorded as
    /// inactive stay out until explicitly activated.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let persisted = self.state.read_active_members().await?;

        for member in &self.members {
            let active = match &persisted {
                None => true,
                Some(ids) => {
                    ids.contains(&member.id) || self.state.member_record(&member.id).await?.is_none()
                }
            };
            if active {
                self.activate(member).await?;
            } else {
                tracing::info!("Member {} was inactive at shutdown, leaving it out", member);
            }
        }

        tracing::info!(
            "Cluster {} started with {} of {} members active",
            self.id,
            self.balancer.snapshot().len(),
            self.members.len()
        );

        self.durability.recover(self).await
    }

    /// Add a member to the active set. Persisted before it becomes routable.
    pub async fn activate(&self, member: &Member) -> Result<bool> {
        if self.balancer.contains(member) {
            return Ok(false);
        }
        self.state.activate(member).await.map_err(persistence)?;
        let added = self.balancer.add(member.clone());
        if added {
            tracing::info!("Activated member {}", member);
        }
        Ok(added)
    }

    /// Remove a member from the active set and persist why.
    ///
    /// Returns `Ok(false)` if the member was not active. A failure to persist
    /// the change is reported as a persistence error even though the member
    /// is already out of rotation.
    pub async fn deactivate(&self, member: &Member, reason: &str) -> Result<bool> {
        if !self.balancer.remove(member) {
            return Ok(false);
        }
        tracing::warn!("Deactivated member {}: {}", member, reason);
        self.state
            .deactivate(member, reason)
            .await
            .map_err(persistence)?;
        Ok(true)
    }

    pub fn is_active(&self, member: &Member) -> bool {
        self.balancer.contains(member)
    }

    /// Durable dispatch under a fresh transaction id
    pub async fn invoke<R>(
        &self,
        strategy: InvocationStrategy,
        phase: Phase,
        invoker: Arc<dyn Invoker<R>>,
    ) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.invoke_in(TransactionId::generate(), strategy, phase, invoker)
            .await
    }

    async fn invoke_in<R>(
        &self,
        transaction_id: TransactionId,
        strategy: InvocationStrategy,
        phase: Phase,
        invoker: Arc<dyn Invoker<R>>,
    ) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        let invoker = self.durability.invoker(
            invoker,
            phase,
            transaction_id,
            Arc::clone(&self.exceptions),
        );
        self.durability
            .strategy(strategy, phase, transaction_id)
            .invoke(self, invoker)
            .await
    }

    /// Classify a statement with the dialect and run it
    pub async fn execute<R>(&self, sql: &str, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        let operation = Operation::for_sql(self.dialect.as_ref(), sql);
        tracing::debug!("Executing {:?} statement", operation.kind);
        self.run(&operation, invoker).await
    }

    /// Run an operation: structural work under the global write lock, named
    /// objects under their own lock, reads on a single member and everything
    /// else durably across all members.
    pub async fn run<R>(&self, operation: &Operation, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        if operation.returns_child {
            return Err(Error::Internal(
                "operation returns a child object; use run_child".into(),
            ));
        }
        let _guard = self.lock_for(operation).await?;
        self.dispatch(operation, invoker).await
    }

    /// Run an operation that creates a child object on each member and drive
    /// the per-member handles through one [`ChildProxy`]. Members that fail
    /// to create theirs are deactivated and left out of the proxy.
    pub async fn run_child<H>(&self, operation: &Operation, invoker: Arc<dyn Invoker<H>>) -> Result<ChildProxy<H>>
    where
        H: ChildHandle + 'static,
    {
        let _guard = self.lock_for(operation).await?;
        let results = self.dispatch(operation, Arc::new(ChildInvoker(invoker))).await?;

        let handles = results.into_iter().filter_map(|(id, child)| {
            self.members
                .iter()
                .find(|member| member.id == id)
                .map(|member| (member.clone(), child.0))
        });
        Ok(ChildProxy::new(handles))
    }

    async fn lock_for(&self, operation: &Operation) -> Result<Option<LockGuard>> {
        Ok(match (operation.kind, &operation.lock_name) {
            (OperationKind::Structural, _) => Some(self.lock(LockDescriptor::write(None)).await?),
            (_, Some(name)) => Some(self.lock(LockDescriptor::write(Some(name))).await?),
            _ => None,
        })
    }

    async fn dispatch<R>(&self, operation: &Operation, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        if operation.is_read_only() {
            InvocationStrategy::Next.invoke(self, invoker).await
        } else {
            self.invoke(self.strategy, Phase::Invoke, invoker).await
        }
    }

    /// Acquire a lock within the configured timeout
    pub async fn lock(&self, descriptor: LockDescriptor) -> Result<LockGuard> {
        let lock = self.locks.lock(descriptor);
        match lock.try_acquire_for(self.lock_timeout).await {
            Some(guard) => Ok(guard),
            None => {
                tracing::warn!(
                    "Could not acquire lock {} within {:?}",
                    lock.descriptor(),
                    self.lock_timeout
                );
                Err(Error::LockTimeout(lock.descriptor().to_string()))
            }
        }
    }

    /// Start a transaction whose phases share one durability id
    pub fn begin(&self) -> ClusterTransaction<'_> {
        ClusterTransaction {
            cluster: self,
            id: TransactionId::generate(),
            phase: None,
        }
    }
}

/// One member's child handle. Handles are member-local, so no two are ever
/// reconciled against each other.
struct Child<H>(H);

impl<H> PartialEq for Child<H> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<H> Debug for Child<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("child")
    }
}

struct ChildInvoker<H>(Arc<dyn Invoker<H>>);

#[async_trait]
impl<H: ChildHandle + 'static> Invoker<Child<H>> for ChildInvoker<H> {
    async fn invoke(&self, member: &Member) -> Result<Child<H>> {
        self.0.invoke(member).await.map(Child)
    }
}

fn persistence(error: Error) -> Error {
    match error.kind() {
        ErrorKind::Persistence => error,
        _ => Error::State(error.to_string()),
    }
}

/// Phases of one client transaction, dispatched under a shared id
pub struct ClusterTransaction<'a> {
    cluster: &'a DatabaseCluster,
    id: TransactionId,
    phase: Option<Phase>,
}

impl ClusterTransaction<'_> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Last phase dispatched
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    async fn dispatch<R>(&mut self, phase: Phase, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        if !phase.may_follow(self.phase) {
            return Err(Error::Internal(format!(
                "{} cannot follow {:?} in transaction {}",
                phase, self.phase, self.id
            )));
        }
        self.phase = Some(phase);
        self.cluster
            .invoke_in(self.id, self.cluster.strategy, phase, invoker)
            .await
    }

    pub async fn invoke<R>(&mut self, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.dispatch(Phase::Invoke, invoker).await
    }

    pub async fn prepare<R>(&mut self, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.dispatch(Phase::Prepare, invoker).await
    }

    pub async fn commit<R>(&mut self, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.dispatch(Phase::Commit, invoker).await
    }

    pub async fn rollback<R>(&mut self, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.dispatch(Phase::Rollback, invoker).await
    }

    pub async fn forget<R>(&mut self, invoker: Arc<dyn Invoker<R>>) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        self.dispatch(Phase::Forget, invoker).await
    }
}

/// Builder for [`DatabaseCluster`]
pub struct DatabaseClusterBuilder {
    id: String,
    members: Vec<Member>,
    balancer: BalancerKind,
    state: Option<Arc<dyn StateManager>>,
    locks: Option<Arc<dyn LockManager>>,
    durability: DurabilityLevel,
    dialect: Option<Arc<dyn Dialect>>,
    exceptions: Option<Arc<dyn ExceptionFactory>>,
    strategy: InvocationStrategy,
    lock_timeout: Duration,
    tx_cache_capacity: usize,
}

impl DatabaseClusterBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            balancer: BalancerKind::Simple,
            state: None,
            locks: None,
            durability: DurabilityLevel::Coarse,
            dialect: None,
            exceptions: None,
            strategy: InvocationStrategy::Parallel,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            tx_cache_capacity: DEFAULT_IN_FLIGHT_CAPACITY,
        }
    }

    pub fn member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    pub fn balancer(mut self, kind: BalancerKind) -> Self {
        self.balancer = kind;
        self
    }

    pub fn state_manager(mut self, state: Arc<dyn StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = level;
        self
    }

    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn exception_factory(mut self, exceptions: Arc<dyn ExceptionFactory>) -> Self {
        self.exceptions = Some(exceptions);
        self
    }

    pub fn strategy(mut self, strategy: InvocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn tx_cache_capacity(mut self, capacity: usize) -> Self {
        self.tx_cache_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<DatabaseCluster> {
        if self.members.is_empty() {
            return Err(Error::Config(format!("cluster {} has no members", self.id)));
        }
        for (i, member) in self.members.iter().enumerate() {
            if member.id.is_empty() {
                return Err(Error::Config("member id must not be empty".into()));
            }
            if self.members[..i].iter().any(|m| m.id == member.id) {
                return Err(Error::Config(format!("duplicate member id '{}'", member.id)));
            }
        }

        let state = self.state.unwrap_or_else(|| Arc::new(NullStateManager));
        let durability = DurabilityTracker::new(
            self.durability,
            Arc::clone(&state),
            self.tx_cache_capacity,
        );

        Ok(DatabaseCluster {
            id: self.id,
            members: self.members,
            balancer: self.balancer.create(),
            state,
            locks: self.locks.unwrap_or_else(|| Arc::new(LocalLockManager::new())),
            durability,
            dialect: self.dialect.unwrap_or_else(|| Arc::new(StandardDialect)),
            exceptions: self
                .exceptions
                .unwrap_or_else(|| Arc::new(DefaultExceptionFactory)),
            strategy: self.strategy,
            lock_timeout: self.lock_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::invoker_fn;
    use crate::recorder::memory::MemoryHandle;
    use crate::recorder::ChildCall;
    use crate::state::SqliteStateManager;
    use bytes::Bytes;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn builder() -> DatabaseClusterBuilder {
        DatabaseCluster::builder("orders")
            .member(Member::new("db1", "mysql://db1/orders").with_weight(2))
            .member(Member::new("db2", "mysql://db2/orders"))
    }

    fn constant(value: u64) -> Arc<dyn Invoker<u64>> {
        invoker_fn(move |_member: Member| async move { Ok(value) }.boxed())
    }

    #[test]
    fn test_build_rejects_bad_members() {
        assert!(DatabaseCluster::builder("empty").build().is_err());
        let duplicate = builder().member(Member::new("db1", "")).build();
        assert!(matches!(duplicate, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_restores_persisted_membership() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        state.activate(&Member::new("db1", "")).await.unwrap();
        state.deactivate(&Member::new("db2", ""), "lagging").await.unwrap();

        let cluster = builder().state_manager(state.clone()).build().unwrap();
        cluster.start().await.unwrap();

        assert!(cluster.is_active(&Member::new("db1", "")));
        assert!(!cluster.is_active(&Member::new("db2", "")));

        // Explicit reactivation is persisted
        assert!(cluster.activate(&Member::new("db2", "")).await.unwrap());
        assert!(state.is_active(&Member::new("db2", "")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unseen_member_is_activated() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        state.activate(&Member::new("db1", "")).await.unwrap();

        let cluster = builder().state_manager(state).build().unwrap();
        cluster.start().await.unwrap();
        assert_eq!(cluster.balancer().snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_twice() {
        let cluster = builder().build().unwrap();
        cluster.start().await.unwrap();
        let db2 = Member::new("db2", "");

        assert!(cluster.deactivate(&db2, "timeout").await.unwrap());
        assert!(!cluster.deactivate(&db2, "timeout").await.unwrap());
        assert_eq!(cluster.balancer().backups().len(), 0);
    }

    #[tokio::test]
    async fn test_read_runs_on_one_member() {
        let cluster = builder().build().unwrap();
        cluster.start().await.unwrap();

        let results = cluster.execute("SELECT * FROM t", constant(5)).await.unwrap();
        assert_eq!(results.len(), 1);

        let results = cluster.execute("UPDATE t SET a = 1", constant(5)).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_structural_statement_waits_for_global_lock() {
        let cluster = builder()
            .lock_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        cluster.start().await.unwrap();

        let held = cluster.lock(LockDescriptor::read(Some("t"))).await.unwrap();
        let err = cluster
            .execute("ALTER TABLE t ADD COLUMN c INT", constant(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);

        drop(held);
        assert!(cluster.execute("ALTER TABLE t ADD COLUMN c INT", constant(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_phases_share_id() {
        let state = Arc::new(SqliteStateManager::in_memory().unwrap());
        let cluster = builder()
            .state_manager(state.clone())
            .durability(DurabilityLevel::Fine)
            .build()
            .unwrap();
        cluster.start().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let invoker = invoker_fn(move |_member: Member| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        });

        let mut tx = cluster.begin();
        tx.invoke(Arc::clone(&invoker)).await.unwrap();
        tx.commit(Arc::clone(&invoker)).await.unwrap();
        assert_eq!(tx.phase(), Some(Phase::Commit));

        // Commit cannot be repeated
        assert!(tx.commit(Arc::clone(&invoker)).await.is_err());
        tx.forget(invoker).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(state.unresolved_invocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_child_proxy_spans_surviving_members() {
        let cluster = builder().member(Member::new("db3", "")).build().unwrap();
        cluster.start().await.unwrap();

        let open = invoker_fn(|member: Member| {
            async move {
                if member.id == "db2" {
                    return Err(Error::ConnectionFailed {
                        address: member.id,
                        reason: "refused".into(),
                    });
                }
                Ok(MemoryHandle::default())
            }
            .boxed()
        });
        let proxy = cluster
            .run_child(&Operation::write().returning_child(), open)
            .await
            .unwrap();

        assert_eq!(proxy.members().await, vec!["db1", "db3"]);
        assert!(!cluster.is_active(&Member::new("db2", "")));

        proxy
            .call(&cluster, ChildCall::Write(Bytes::from_static(b"row")))
            .await
            .unwrap();
        assert_eq!(proxy.recorded().await, 1);
        assert_eq!(proxy.detach("db3").await.unwrap().data, b"row");
    }

    #[tokio::test]
    async fn test_run_rejects_child_operations() {
        let cluster = builder().build().unwrap();
        cluster.start().await.unwrap();

        let err = cluster
            .run(&Operation::write().returning_child(), constant(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
