//! Invocation Strategies
//!
//! How an operation is fanned out across the active members, and how the
//! per-member outcomes are reconciled into a single result.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{Invoker, Results};
use crate::balancer::Balancer;
use crate::cluster::DatabaseCluster;
use crate::error::{Error, ErrorKind, Result};
use crate::member::Member;

/// Per-member outcome, in dispatch order
type Outcomes<R> = Vec<(Member, Result<R>)>;

/// Dispatch strategies, selectable by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationStrategy {
    /// One member at a time in priority order
    Sequential,
    /// All members concurrently, joined before returning
    Parallel,
    /// Primary synchronously, then backups concurrently
    PrimaryThenReplicate,
    /// A single member chosen by the balancer (read-only work)
    Next,
}

impl InvocationStrategy {
    pub fn id(&self) -> &'static str {
        match self {
            InvocationStrategy::Sequential => "sequential",
            InvocationStrategy::Parallel => "parallel",
            InvocationStrategy::PrimaryThenReplicate => "primary-then-replicate",
            InvocationStrategy::Next => "next",
        }
    }

    /// Execute the invoker against the cluster.
    ///
    /// Members that fail while another member succeeds are deactivated and
    /// left out of the returned map. If every member fails the primary's error
    /// is returned. Surviving members that disagree on the value produce
    /// [`Error::InconsistentResults`].
    pub async fn invoke<R>(
        &self,
        cluster: &DatabaseCluster,
        invoker: Arc<dyn Invoker<R>>,
    ) -> Result<Results<R>>
    where
        R: PartialEq + Debug + Send + 'static,
    {
        match self {
            InvocationStrategy::Sequential => {
                let members = snapshot(cluster)?;
                let outcomes = sequential(cluster, members, invoker.as_ref()).await?;
                reconcile(cluster, outcomes).await
            }
            InvocationStrategy::Parallel => {
                let members = snapshot(cluster)?;
                let outcomes = parallel(cluster.balancer(), members, &invoker).await;
                reconcile(cluster, outcomes).await
            }
            InvocationStrategy::PrimaryThenReplicate => {
                primary_then_replicate(cluster, &invoker).await
            }
            InvocationStrategy::Next => next(cluster, invoker.as_ref()).await,
        }
    }
}

impl std::str::FromStr for InvocationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(InvocationStrategy::Sequential),
            "parallel" => Ok(InvocationStrategy::Parallel),
            "primary-then-replicate" => Ok(InvocationStrategy::PrimaryThenReplicate),
            "next" => Ok(InvocationStrategy::Next),
            other => Err(Error::UnknownFactory {
                kind: "invocation strategy",
                id: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for InvocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Keeps the balancer's in-flight count accurate even if the call is dropped
struct InFlight<'a> {
    balancer: &'a dyn Balancer,
    member: &'a Member,
}

impl<'a> InFlight<'a> {
    fn start(balancer: &'a dyn Balancer, member: &'a Member) -> Self {
        balancer.begin(member);
        Self { balancer, member }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.balancer.end(self.member);
    }
}

async fn dispatch<R: Send>(
    balancer: &dyn Balancer,
    invoker: &dyn Invoker<R>,
    member: &Member,
) -> Result<R> {
    let _in_flight = InFlight::start(balancer, member);
    tracing::trace!("Dispatching to member {}", member);
    invoker.invoke(member).await
}

fn snapshot(cluster: &DatabaseCluster) -> Result<Vec<Member>> {
    let members = cluster.balancer().snapshot();
    if members.is_empty() {
        return Err(Error::NoActiveMembers);
    }
    Ok(members)
}

/// Invoke each member in turn.
///
/// Stops early only when a cluster-fatal error occurs before any member has
/// succeeded; later failures are left for reconciliation.
async fn sequential<R: Send>(
    cluster: &DatabaseCluster,
    members: Vec<Member>,
    invoker: &dyn Invoker<R>,
) -> Result<Outcomes<R>> {
    let balancer = cluster.balancer();
    let mut outcomes = Vec::with_capacity(members.len());

    for member in members {
        let result = dispatch(balancer.as_ref(), invoker, &member).await;
        match result {
            Err(e)
                if outcomes.iter().all(|(_, r): &(Member, Result<R>)| r.is_err())
                    && cluster.exception_factory().classify(&e) == ErrorKind::ClusterFatal =>
            {
                tracing::debug!("Cluster-fatal error from {}, not continuing: {}", member, e);
                return Err(e);
            }
            result => outcomes.push((member, result)),
        }
    }

    Ok(outcomes)
}

/// Invoke every member concurrently, one task per member.
///
/// Dropping the returned future drops the `JoinSet`, which aborts every task
/// still running.
async fn parallel<R>(
    balancer: Arc<dyn Balancer>,
    members: Vec<Member>,
    invoker: &Arc<dyn Invoker<R>>,
) -> Outcomes<R>
where
    R: Send + 'static,
{
    let mut tasks = JoinSet::new();

    for (index, member) in members.into_iter().enumerate() {
        let invoker = Arc::clone(invoker);
        let balancer = Arc::clone(&balancer);
        tasks.spawn(async move {
            let result = AssertUnwindSafe(dispatch(balancer.as_ref(), invoker.as_ref(), &member))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::member(&member.id, "invocation panicked")));
            (index, member, result)
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!("Member invocation task failed: {}", e),
        }
    }

    outcomes.sort_by_key(|(index, _, _)| *index);
    outcomes
        .into_iter()
        .map(|(_, member, result)| (member, result))
        .collect()
}

async fn primary_then_replicate<R>(
    cluster: &DatabaseCluster,
    invoker: &Arc<dyn Invoker<R>>,
) -> Result<Results<R>>
where
    R: PartialEq + Debug + Send + 'static,
{
    let balancer = cluster.balancer();

    loop {
        let members = snapshot(cluster)?;
        let (primary, backups) = match members.split_first() {
            Some(split) => split,
            None => return Err(Error::NoActiveMembers),
        };

        match dispatch(balancer.as_ref(), invoker.as_ref(), primary).await {
            Ok(value) => {
                let mut outcomes = vec![(primary.clone(), Ok(value))];
                outcomes.extend(parallel(Arc::clone(&balancer), backups.to_vec(), invoker).await);
                return reconcile(cluster, outcomes).await;
            }
            Err(e) if !backups.is_empty() && cluster.exception_factory().is_member_failure(&e) => {
                tracing::warn!("Primary {} failed, promoting next member: {}", primary, e);
                cluster.deactivate(primary, &e.to_string()).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Route to a single member; on member failure deactivate it and try the next
async fn next<R: Send>(cluster: &DatabaseCluster, invoker: &dyn Invoker<R>) -> Result<Results<R>> {
    let balancer = cluster.balancer();

    loop {
        let member = balancer.next().ok_or(Error::NoActiveMembers)?;

        match dispatch(balancer.as_ref(), invoker, &member).await {
            Ok(value) => {
                let mut results = Results::new();
                results.insert(member.id, value);
                return Ok(results);
            }
            Err(e) if balancer.snapshot().len() > 1 && cluster.exception_factory().is_member_failure(&e) => {
                tracing::warn!("Read on {} failed, trying another member: {}", member, e);
                cluster.deactivate(&member, &e.to_string()).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fold per-member outcomes into the operation result
async fn reconcile<R>(cluster: &DatabaseCluster, outcomes: Outcomes<R>) -> Result<Results<R>>
where
    R: PartialEq + Debug,
{
    let mut results = Results::new();
    let mut failed = Vec::new();

    for (member, result) in outcomes {
        match result {
            Ok(value) => {
                results.insert(member.id.clone(), value);
            }
            Err(e) => failed.push((member, e)),
        }
    }

    if results.is_empty() {
        let (member, error) = failed.into_iter().next().ok_or(Error::NoActiveMembers)?;
        tracing::debug!("Every member failed, returning error from {}", member);
        return Err(error);
    }

    // A state-store failure says nothing about the member's health
    if let Some(pos) = failed.iter().position(|(_, e)| e.kind() == ErrorKind::Persistence) {
        return Err(failed.swap_remove(pos).1);
    }

    for (member, error) in &failed {
        tracing::warn!("Member {} failed while others succeeded: {}", member, error);
        cluster.deactivate(member, &error.to_string()).await?;
    }

    let mut values = results.iter();
    if let Some((first_id, first)) = values.next() {
        let diverging: Vec<String> = values
            .filter(|(_, value)| *value != first)
            .map(|(id, value)| format!("{}={:?}", id, value))
            .collect();
        if !diverging.is_empty() {
            tracing::error!("Members disagree with {}={:?}: {}", first_id, first, diverging.join(", "));
            return Err(Error::InconsistentResults(format!(
                "{}={:?} vs {}",
                first_id,
                first,
                diverging.join(", ")
            )));
        }
    }

    Ok(results)
}
