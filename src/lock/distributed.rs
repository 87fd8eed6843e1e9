//! Distributed lock manager
//!
//! A lock is held cluster-wide only when the local lock and every peer's lock
//! are held. Peers are asked over a [`CommandChannel`]; each runs a
//! [`RemoteLockRegistry`] that takes its own local lock on the requester's
//! behalf.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{LocalLock, LocalLockManager, Lock, LockDescriptor, LockGuard, LockManager};
use crate::error::{Error, Result};

/// Command sent to a peer's lock registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        requester: String,
        descriptor: LockDescriptor,
        timeout_ms: u64,
    },
    Release {
        requester: String,
        descriptor: LockDescriptor,
    },
}

impl LockCommand {
    pub fn type_name(&self) -> &'static str {
        match self {
            LockCommand::Acquire { .. } => "Acquire",
            LockCommand::Release { .. } => "Release",
        }
    }

    /// Release that reverts a granted acquire
    pub fn undo(&self) -> Option<LockCommand> {
        match self {
            LockCommand::Acquire {
                requester,
                descriptor,
                ..
            } => Some(LockCommand::Release {
                requester: requester.clone(),
                descriptor: descriptor.clone(),
            }),
            LockCommand::Release { .. } => None,
        }
    }
}

/// Delivers lock commands to peers. `Ok(true)` means granted (or released).
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send(&self, node: &str, command: LockCommand) -> Result<bool>;
}

/// Releases remote grants for one acquisition
pub(crate) struct RemoteRelease {
    channel: Arc<dyn CommandChannel>,
    nodes: Vec<String>,
    requester: String,
    descriptor: LockDescriptor,
}

impl RemoteRelease {
    pub(crate) async fn release(self) {
        let command = LockCommand::Release {
            requester: self.requester.clone(),
            descriptor: self.descriptor.clone(),
        };
        let channel = &self.channel;
        let results = join_all(self.nodes.iter().map(|node| {
            let command = command.clone();
            async move { (node, channel.send(node, command).await) }
        }))
        .await;

        for (node, result) in results {
            match result {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "Node {} held no lock {} for {}",
                    node, self.descriptor, self.requester
                ),
                Err(e) => tracing::warn!(
                    "Failed to release lock {} on {}: {}",
                    self.descriptor, node, e
                ),
            }
        }
    }
}

/// Lock manager spanning this node and its peers
pub struct DistributedLockManager {
    node_id: String,
    local: Arc<LocalLockManager>,
    channel: Arc<dyn CommandChannel>,
    peers: Vec<String>,
    timeout: Duration,
}

impl DistributedLockManager {
    pub fn new(
        node_id: impl Into<String>,
        local: Arc<LocalLockManager>,
        channel: Arc<dyn CommandChannel>,
        peers: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            local,
            channel,
            peers,
            timeout,
        }
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }
}

impl LockManager for DistributedLockManager {
    fn lock(&self, descriptor: LockDescriptor) -> Box<dyn Lock> {
        Box::new(DistributedLock {
            local: self.local.local_lock(descriptor.clone()),
            descriptor,
            channel: Arc::clone(&self.channel),
            peers: self.peers.clone(),
            requester: self.node_id.clone(),
            timeout: self.timeout,
        })
    }
}

/// Local lock plus the same lock on every peer
pub struct DistributedLock {
    descriptor: LockDescriptor,
    local: LocalLock,
    channel: Arc<dyn CommandChannel>,
    peers: Vec<String>,
    requester: String,
    /// Bound for `acquire` and the remote phase of interruptible acquisition
    timeout: Duration,
}

impl DistributedLock {
    /// Ask every peer for the lock. All-or-nothing: on any refusal the
    /// granted peers are released and the local guard is dropped. A peer
    /// whose reply never arrived may still have granted, so it is released
    /// too.
    async fn acquire_remote(&self, local: LockGuard, timeout: Duration) -> Option<LockGuard> {
        if self.peers.is_empty() {
            return Some(local);
        }

        let command = LockCommand::Acquire {
            requester: self.requester.clone(),
            descriptor: self.descriptor.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let channel = &self.channel;
        let replies = join_all(self.peers.iter().map(|node| {
            let command = command.clone();
            async move { (node.clone(), channel.send(node, command).await) }
        }))
        .await;

        let mut granted = Vec::new();
        let mut uncertain = Vec::new();
        for (node, reply) in replies {
            match reply {
                Ok(true) => granted.push(node),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Lock request to {} failed: {}", node, e);
                    uncertain.push(node);
                }
            }
        }

        if granted.len() == self.peers.len() {
            return Some(local.with_remote(RemoteRelease {
                channel: Arc::clone(&self.channel),
                nodes: granted,
                requester: self.requester.clone(),
                descriptor: self.descriptor.clone(),
            }));
        }

        tracing::debug!(
            "Lock {} refused by {} of {} peers",
            self.descriptor,
            self.peers.len() - granted.len(),
            self.peers.len()
        );
        granted.extend(uncertain);
        RemoteRelease {
            channel: Arc::clone(&self.channel),
            nodes: granted,
            requester: self.requester.clone(),
            descriptor: self.descriptor.clone(),
        }
        .release()
        .await;
        drop(local);
        None
    }
}

#[async_trait]
impl Lock for DistributedLock {
    fn descriptor(&self) -> &LockDescriptor {
        &self.descriptor
    }

    async fn acquire(&self) -> Result<LockGuard> {
        let local = self.local.acquire().await?;
        self.acquire_remote(local, self.timeout)
            .await
            .ok_or_else(|| Error::LockTimeout(self.descriptor.to_string()))
    }

    async fn try_acquire_for(&self, timeout: Duration) -> Option<LockGuard> {
        let deadline = Instant::now() + timeout;
        let local = self.local.try_acquire_for(timeout).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.acquire_remote(local, remaining).await
    }

    async fn acquire_interruptibly(&self, cancel: &CancellationToken) -> Result<LockGuard> {
        let local = self.local.acquire_interruptibly(cancel).await?;
        // Remote phase is bounded by the timeout; an interrupt that lands
        // during it still gives everything back
        let guard = self
            .acquire_remote(local, self.timeout)
            .await
            .ok_or_else(|| Error::LockTimeout(self.descriptor.to_string()))?;
        if cancel.is_cancelled() {
            guard.release().await;
            return Err(Error::LockInterrupted(self.descriptor.to_string()));
        }
        Ok(guard)
    }
}

/// Peer side of the distributed lock: holds local locks for remote requesters
pub struct RemoteLockRegistry {
    local: Arc<LocalLockManager>,
    held: Mutex<HashMap<(String, LockDescriptor), Vec<LockGuard>>>,
    shutdown: CancellationToken,
}

impl RemoteLockRegistry {
    pub fn new(local: Arc<LocalLockManager>) -> Self {
        Self {
            local,
            held: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Apply a command from a peer
    pub async fn handle(&self, command: LockCommand) -> bool {
        match command {
            LockCommand::Acquire {
                requester,
                descriptor,
                timeout_ms,
            } => {
                let lock = self.local.local_lock(descriptor.clone());
                let acquired = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    guard = lock.try_acquire_for(Duration::from_millis(timeout_ms)) => guard,
                };
                match acquired {
                    Some(guard) => {
                        tracing::debug!("Granted lock {} to {}", descriptor, requester);
                        self.held.lock()
                            .entry((requester, descriptor))
                            .or_default()
                            .push(guard);
                        true
                    }
                    None => false,
                }
            }
            LockCommand::Release {
                requester,
                descriptor,
            } => {
                let key = (requester, descriptor);
                let mut held = self.held.lock();
                let Some(guards) = held.get_mut(&key) else {
                    return false;
                };
                guards.pop();
                if guards.is_empty() {
                    held.remove(&key);
                }
                tracing::debug!("Released lock {} for {}", key.1, key.0);
                true
            }
        }
    }

    /// Locks currently held for peers
    pub fn held(&self) -> usize {
        self.held.lock().values().map(Vec::len).sum()
    }

    /// Abort pending acquisitions and drop every held lock
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.held.lock().clear();
    }
}
