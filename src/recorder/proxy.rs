//! Child proxy: one handle per member, driven in lockstep

use std::collections::BTreeMap;
use futures::future::join_all;
use tokio::sync::Mutex;

use super::{ChildCall, ChildHandle, InvocationRecorder};
use crate::cluster::DatabaseCluster;
use crate::error::{Error, Result};
use crate::member::Member;

struct Inner<H> {
    handles: BTreeMap<String, (Member, H)>,
    recorder: InvocationRecorder,
}

/// Fans every call on a child object out to each member's handle and records
/// it for members that join later.
///
/// Calls are serialized, so the recorded order is the order every handle saw.
pub struct ChildProxy<H> {
    inner: Mutex<Inner<H>>,
}

impl<H: ChildHandle> ChildProxy<H> {
    pub fn new(handles: impl IntoIterator<Item = (Member, H)>) -> Self {
        let handles = handles
            .into_iter()
            .map(|(member, handle)| (member.id.clone(), (member, handle)))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                handles,
                recorder: InvocationRecorder::new(),
            }),
        }
    }

    /// Members currently holding a handle
    pub async fn members(&self) -> Vec<String> {
        self.inner.lock().await.handles.keys().cloned().collect()
    }

    /// Calls recorded so far
    pub async fn recorded(&self) -> usize {
        self.inner.lock().await.recorder.len()
    }

    /// Apply a call to every handle and record it.
    ///
    /// Handles that fail while another succeeds are dropped and their members
    /// deactivated. If every handle fails the call is not recorded and the
    /// first error is returned. The call stays recorded even when persisting
    /// a deactivation fails; that error is returned afterwards.
    pub async fn call(&self, cluster: &DatabaseCluster, call: ChildCall) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.recorder.is_closed() {
            return Err(Error::Internal(format!("{} on closed child object", call.name())));
        }
        let Inner { handles, recorder } = &mut *inner;

        let outcomes = join_all(handles.values_mut().map(|(member, handle)| {
            let call = &call;
            async move { (member.clone(), call.apply(handle).await) }
        }))
        .await;

        let total = outcomes.len();
        let mut failed: Vec<(Member, Error)> = outcomes
            .into_iter()
            .filter_map(|(member, result)| result.err().map(|e| (member, e)))
            .collect();

        if total > 0 && failed.len() == total {
            tracing::debug!("{} failed on every member", call.name());
            return Err(failed.swap_remove(0).1);
        }

        for (member, error) in &failed {
            handles.remove(&member.id);
            tracing::warn!("Child {} failed on {}: {}", call.name(), member, error);
        }
        recorder.record(call)?;

        let mut first_error = None;
        for (member, error) in failed {
            if let Err(e) = cluster.deactivate(&member, &error.to_string()).await {
                tracing::error!("Failed to persist deactivation of {}: {}", member, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Bring a member's fresh handle up to date by replaying every recorded
    /// call, then include it in later calls. A member whose replay fails is
    /// deactivated.
    pub async fn sync_member(&self, cluster: &DatabaseCluster, member: Member, mut fresh: H) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.recorder.replay(&mut fresh).await {
            Ok(()) => {
                tracing::debug!(
                    "Replayed {} calls onto {}",
                    inner.recorder.len(),
                    member
                );
                inner.handles.insert(member.id.clone(), (member, fresh));
                Ok(())
            }
            Err(e) => {
                let reason = format!("replay failed: {}", e);
                cluster.deactivate(&member, &reason).await?;
                Err(Error::Replay {
                    member: member.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop driving a member's handle and hand it back
    pub async fn detach(&self, member_id: &str) -> Option<H> {
        self.inner
            .lock()
            .await
            .handles
            .remove(member_id)
            .map(|(_, handle)| handle)
    }

    /// Close the child on every member; recorded as the final call
    pub async fn close(&self, cluster: &DatabaseCluster) -> Result<()> {
        self.call(cluster, ChildCall::Close).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use async_trait::async_trait;
    use crate::durability::{DurabilityEvent, InvocationEvent, InvokerEvent};
    use crate::recorder::memory::MemoryHandle;
    use crate::state::{MemberRecord, NullStateManager, StateManager};
    use bytes::Bytes;

    /// Persists nothing and cannot record deactivations
    struct FullDisk;

    #[async_trait]
    impl StateManager for FullDisk {
        async fn read_active_members(&self) -> Result<Option<BTreeSet<String>>> {
            NullStateManager.read_active_members().await
        }
        async fn activate(&self, member: &Member) -> Result<()> {
            NullStateManager.activate(member).await
        }
        async fn deactivate(&self, _member: &Member, _reason: &str) -> Result<()> {
            Err(Error::State("disk full".into()))
        }
        async fn is_active(&self, member: &Member) -> Result<bool> {
            NullStateManager.is_active(member).await
        }
        async fn member_record(&self, member_id: &str) -> Result<Option<MemberRecord>> {
            NullStateManager.member_record(member_id).await
        }
        async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
            NullStateManager.before_invocation(event).await
        }
        async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
            NullStateManager.after_invocation(event).await
        }
        async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
            NullStateManager.before_invoker(event).await
        }
        async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
            NullStateManager.after_invoker(event).await
        }
        async fn unresolved_invocations(&self) -> Result<Vec<InvocationEvent>> {
            NullStateManager.unresolved_invocations().await
        }
        async fn invoker_events(&self, event: &DurabilityEvent) -> Result<Vec<InvokerEvent>> {
            NullStateManager.invoker_events(event).await
        }
    }

    async fn cluster() -> DatabaseCluster {
        let cluster = DatabaseCluster::builder("test")
            .member(Member::new("db1", "").with_weight(3))
            .member(Member::new("db2", "").with_weight(2))
            .member(Member::new("db3", "").with_weight(1))
            .build()
            .unwrap();
        cluster.start().await.unwrap();
        cluster
    }

    fn write(data: &'static [u8]) -> ChildCall {
        ChildCall::Write(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_failed_handle_is_dropped_and_member_deactivated() {
        let cluster = cluster().await;
        let proxy = ChildProxy::new(vec![
            (Member::new("db1", ""), MemoryHandle::default()),
            (Member::new("db2", ""), MemoryHandle::failing_after(1)),
            (Member::new("db3", ""), MemoryHandle::default()),
        ]);

        proxy.call(&cluster, write(b"hello ")).await.unwrap();
        proxy.call(&cluster, write(b"world")).await.unwrap();

        assert_eq!(proxy.members().await, vec!["db1", "db3"]);
        assert!(!cluster.is_active(&Member::new("db2", "")));
        assert_eq!(proxy.recorded().await, 2);
    }

    #[tokio::test]
    async fn test_rejoining_member_catches_up() {
        let cluster = cluster().await;
        let proxy = ChildProxy::new(vec![(Member::new("db1", ""), MemoryHandle::default())]);

        proxy.call(&cluster, write(b"abcdef")).await.unwrap();
        proxy
            .call(
                &cluster,
                ChildCall::SetBytes {
                    position: 1,
                    data: Bytes::from_static(b"ZZ"),
                },
            )
            .await
            .unwrap();

        proxy
            .sync_member(&cluster, Member::new("db2", ""), MemoryHandle::default())
            .await
            .unwrap();
        proxy.call(&cluster, ChildCall::Truncate(4)).await.unwrap();
        proxy.close(&cluster).await.unwrap();

        let db1 = proxy.detach("db1").await.unwrap();
        let db2 = proxy.detach("db2").await.unwrap();
        assert_eq!(db1.data, b"aZZd");
        assert_eq!(db2.observable(), db1.observable());
        assert!(db2.closed);
    }

    #[tokio::test]
    async fn test_failed_replay_deactivates_member() {
        let cluster = cluster().await;
        let proxy = ChildProxy::new(vec![(Member::new("db1", ""), MemoryHandle::default())]);
        proxy.call(&cluster, write(b"a")).await.unwrap();
        proxy.call(&cluster, write(b"b")).await.unwrap();

        let err = proxy
            .sync_member(&cluster, Member::new("db3", ""), MemoryHandle::failing_after(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Replay { .. }));
        assert!(!cluster.is_active(&Member::new("db3", "")));
        assert_eq!(proxy.members().await, vec!["db1"]);
    }

    #[tokio::test]
    async fn test_every_handle_failing_is_not_recorded() {
        let cluster = cluster().await;
        let proxy = ChildProxy::new(vec![
            (Member::new("db1", ""), MemoryHandle::failing_after(0)),
            (Member::new("db2", ""), MemoryHandle::failing_after(0)),
        ]);

        assert!(proxy.call(&cluster, ChildCall::Flush).await.is_err());
        assert_eq!(proxy.recorded().await, 0);
        assert_eq!(cluster.balancer().snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_no_calls_after_close() {
        let cluster = cluster().await;
        let proxy: ChildProxy<MemoryHandle> = ChildProxy::new(Vec::new());
        proxy.close(&cluster).await.unwrap();
        assert!(proxy.call(&cluster, ChildCall::Flush).await.is_err());
    }

    #[tokio::test]
    async fn test_call_recorded_when_deactivation_not_persisted() {
        let cluster = DatabaseCluster::builder("test")
            .member(Member::new("db1", ""))
            .member(Member::new("db2", ""))
            .member(Member::new("db3", ""))
            .state_manager(Arc::new(FullDisk))
            .build()
            .unwrap();
        cluster.start().await.unwrap();
        let proxy = ChildProxy::new(vec![
            (Member::new("db1", ""), MemoryHandle::default()),
            (Member::new("db2", ""), MemoryHandle::failing_after(0)),
        ]);

        let err = proxy.call(&cluster, write(b"hello")).await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(proxy.members().await, vec!["db1"]);
        assert_eq!(proxy.recorded().await, 1);

        proxy
            .sync_member(&cluster, Member::new("db3", ""), MemoryHandle::default())
            .await
            .unwrap();
        let db1 = proxy.detach("db1").await.unwrap();
        let db3 = proxy.detach("db3").await.unwrap();
        assert_eq!(db3.observable(), db1.observable());
    }
}
