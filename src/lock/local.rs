//! In-process lock manager

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{GuardPart, Lock, LockDescriptor, LockGuard, LockManager, LockMode};
use crate::error::{Error, Result};

/// Global lock plus one lock per name.
///
/// Named entries are created on first use and never removed, so the registry
/// grows with the number of distinct names ever locked.
#[derive(Default)]
pub struct LocalLockManager {
    global: Arc<RwLock<()>>,
    named: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn named(&self, name: &str) -> Arc<RwLock<()>> {
        let mut named = self.named.lock();
        Arc::clone(named.entry(name.to_string()).or_default())
    }

    /// Concrete lock handle
    pub fn local_lock(&self, descriptor: LockDescriptor) -> LocalLock {
        let named = descriptor.name.as_deref().map(|name| self.named(name));
        LocalLock {
            descriptor,
            global: Arc::clone(&self.global),
            named,
        }
    }

    /// Number of distinct names locked so far
    pub fn registered_names(&self) -> usize {
        self.named.lock().len()
    }
}

impl LockManager for LocalLockManager {
    fn lock(&self, descriptor: LockDescriptor) -> Box<dyn Lock> {
        Box::new(self.local_lock(descriptor))
    }
}

/// Lock handle over the local registry
pub struct LocalLock {
    descriptor: LockDescriptor,
    global: Arc<RwLock<()>>,
    named: Option<Arc<RwLock<()>>>,
}

async fn component(lock: &Arc<RwLock<()>>, mode: LockMode) -> GuardPart {
    match mode {
        LockMode::Read => GuardPart::Read(Arc::clone(lock).read_owned().await),
        LockMode::Write => GuardPart::Write(Arc::clone(lock).write_owned().await),
    }
}

impl LocalLock {
    /// Global side first, then the named side. If this future is dropped
    /// part-way, the components already held are dropped with it.
    async fn acquire_parts(&self) -> Vec<GuardPart> {
        match &self.named {
            None => vec![component(&self.global, self.descriptor.mode).await],
            Some(named) => {
                let global = component(&self.global, LockMode::Read).await;
                let named = component(named, self.descriptor.mode).await;
                vec![global, named]
            }
        }
    }
}

#[async_trait]
impl Lock for LocalLock {
    fn descriptor(&self) -> &LockDescriptor {
        &self.descriptor
    }

    async fn acquire(&self) -> Result<LockGuard> {
        let parts = self.acquire_parts().await;
        tracing::trace!("Acquired lock {}", self.descriptor);
        Ok(LockGuard::new(self.descriptor.clone(), parts))
    }

    async fn try_acquire_for(&self, timeout: Duration) -> Option<LockGuard> {
        match tokio::time::timeout(timeout, self.acquire_parts()).await {
            Ok(parts) => Some(LockGuard::new(self.descriptor.clone(), parts)),
            Err(_) => {
                tracing::debug!("Lock {} not available within {:?}", self.descriptor, timeout);
                None
            }
        }
    }

    async fn acquire_interruptibly(&self, cancel: &CancellationToken) -> Result<LockGuard> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Interrupted acquiring lock {}", self.descriptor);
                Err(Error::LockInterrupted(self.descriptor.to_string()))
            }
            parts = self.acquire_parts() => Ok(LockGuard::new(self.descriptor.clone(), parts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_named_attempt_releases_global() {
        let manager = LocalLockManager::new();
        let holder = manager.write_lock(Some("orders")).acquire().await.unwrap();

        // Global read is free, the named lock is not
        let attempt = manager
            .read_lock(Some("orders"))
            .try_acquire_for(Duration::from_millis(10))
            .await;
        assert!(attempt.is_none());

        // The holder still blocks structural work
        assert!(manager.write_lock(None).try_acquire().await.is_none());

        drop(holder);
        // Nothing leaked from the failed attempt
        let structural = manager.write_lock(None).try_acquire().await;
        assert!(structural.is_some());
    }

    #[tokio::test]
    async fn test_interrupt_releases_partial_acquisition() {
        let manager = Arc::new(LocalLockManager::new());
        let holder = manager.write_lock(Some("orders")).acquire().await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .write_lock(Some("orders"))
                    .acquire_interruptibly(&cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::LockInterrupted(_))));
        assert!(cancel.is_cancelled());

        drop(holder);
        assert!(manager.write_lock(None).try_acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_unrelated_names_are_concurrent() {
        let manager = LocalLockManager::new();
        let _orders = manager.write_lock(Some("orders")).acquire().await.unwrap();
        let customers = manager.write_lock(Some("customers")).try_acquire().await;
        assert!(customers.is_some());
        assert_eq!(manager.registered_names(), 2);
    }

    #[tokio::test]
    async fn test_global_write_excludes_named_locks() {
        let manager = LocalLockManager::new();
        let structural = manager.write_lock(None).acquire().await.unwrap();

        assert!(manager.read_lock(Some("orders")).try_acquire().await.is_none());
        drop(structural);
        assert!(manager.read_lock(Some("orders")).try_acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_shared_readers() {
        let manager = LocalLockManager::new();
        let _a = manager.read_lock(Some("orders")).acquire().await.unwrap();
        let b = manager.read_lock(Some("orders")).try_acquire().await;
        assert!(b.is_some());
    }
}
