//! Lock Management Module
//!
//! Cluster-wide mutual exclusion for structural operations. There is one
//! global lock plus a lazily created lock per object name. Locking a name
//! always takes the global lock's read side first, so a structural operation
//! (global write) never interleaves with named-object work while unrelated
//! names still proceed concurrently.
//!
//! Acquisition is all-or-nothing: a timed-out or interrupted attempt releases
//! whatever component it already held.

mod local;
mod distributed;

pub use local::{LocalLock, LocalLockManager};
pub use distributed::{
    CommandChannel, DistributedLock, DistributedLockManager, LockCommand, RemoteLockRegistry,
};

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use distributed::RemoteRelease;

/// Shared or exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Which lock, in which mode. `name == None` is the global lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub name: Option<String>,
    pub mode: LockMode,
}

impl LockDescriptor {
    pub fn read(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            mode: LockMode::Read,
        }
    }

    pub fn write(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            mode: LockMode::Write,
        }
    }

    pub fn is_global(&self) -> bool {
        self.name.is_none()
    }
}

impl std::fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            LockMode::Read => "read",
            LockMode::Write => "write",
        };
        match &self.name {
            Some(name) => write!(f, "{}:{}", name, mode),
            None => write!(f, "<global>:{}", mode),
        }
    }
}

pub(crate) enum GuardPart {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Held lock. Dropping it releases every component in reverse acquisition
/// order (named before global, remote before local).
pub struct LockGuard {
    descriptor: LockDescriptor,
    parts: Vec<GuardPart>,
    remote: Option<RemoteRelease>,
}

impl LockGuard {
    pub(crate) fn new(descriptor: LockDescriptor, parts: Vec<GuardPart>) -> Self {
        Self {
            descriptor,
            parts,
            remote: None,
        }
    }

    pub(crate) fn with_remote(mut self, remote: RemoteRelease) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn descriptor(&self) -> &LockDescriptor {
        &self.descriptor
    }

    /// Release, waiting for remote nodes to acknowledge
    pub async fn release(mut self) {
        if let Some(remote) = self.remote.take() {
            remote.release().await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(remote) = self.remote.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(remote.release());
                }
                Err(_) => tracing::warn!(
                    "No runtime to release remote lock {}; remote nodes keep it",
                    self.descriptor
                ),
            }
        }
        while let Some(part) = self.parts.pop() {
            drop(part);
        }
        tracing::trace!("Released lock {}", self.descriptor);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("descriptor", &self.descriptor)
            .field("components", &self.parts.len())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// A lock that can be acquired
#[async_trait]
pub trait Lock: Send + Sync {
    fn descriptor(&self) -> &LockDescriptor;

    /// Wait until acquired
    async fn acquire(&self) -> Result<LockGuard>;

    /// Acquire within `timeout`, or give up holding nothing
    async fn try_acquire_for(&self, timeout: Duration) -> Option<LockGuard>;

    /// Acquire, or fail with [`crate::Error::LockInterrupted`] once `cancel`
    /// fires. The token stays cancelled so the caller still observes the
    /// interruption.
    async fn acquire_interruptibly(&self, cancel: &CancellationToken) -> Result<LockGuard>;

    /// Acquire only if immediately available
    async fn try_acquire(&self) -> Option<LockGuard> {
        self.try_acquire_for(Duration::ZERO).await
    }
}

/// Hands out locks by descriptor
pub trait LockManager: Send + Sync {
    fn lock(&self, descriptor: LockDescriptor) -> Box<dyn Lock>;

    /// Shared lock; `None` is the global lock
    fn read_lock(&self, name: Option<&str>) -> Box<dyn Lock> {
        self.lock(LockDescriptor::read(name))
    }

    /// Exclusive lock; `None` is the global lock
    fn write_lock(&self, name: Option<&str>) -> Box<dyn Lock> {
        self.lock(LockDescriptor::write(name))
    }
}
