//! Member Connection Pool
//!
//! Keeps idle connections per member. When a member's pool is exhausted the
//! caller gets a directly created connection instead of an error; it is
//! destroyed on release rather than pooled.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Result;
use crate::member::Member;

/// Creates, checks and disposes of member connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send;

    async fn create(&self, member: &Member) -> Result<Self::Connection>;

    /// Whether an idle connection may be handed out again
    async fn validate(&self, connection: &mut Self::Connection) -> bool;

    async fn destroy(&self, connection: Self::Connection);
}

/// A connection checked out of a [`MemberPool`]
pub struct PooledConnection<C> {
    connection: C,
    member_id: String,
    /// `None` for connections created outside the pool
    permit: Option<OwnedSemaphorePermit>,
}

impl<C> PooledConnection<C> {
    pub fn is_pooled(&self) -> bool {
        self.permit.is_some()
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}

struct MemberSlots<C> {
    permits: Arc<Semaphore>,
    idle: Vec<C>,
}

/// Per-member connection pool
pub struct MemberPool<F: ConnectionFactory> {
    factory: F,
    max_connections: usize,
    acquire_timeout: Duration,
    slots: Mutex<HashMap<String, MemberSlots<F::Connection>>>,
}

impl<F: ConnectionFactory> MemberPool<F> {
    pub fn new(factory: F, max_connections: usize, acquire_timeout: Duration) -> Self {
        Self {
            factory,
            max_connections,
            acquire_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn permits(&self, member: &Member) -> Arc<Semaphore> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(member.id.clone()).or_insert_with(|| MemberSlots {
            permits: Arc::new(Semaphore::new(self.max_connections)),
            idle: Vec::new(),
        });
        Arc::clone(&slot.permits)
    }

    fn pop_idle(&self, member: &Member) -> Option<F::Connection> {
        self.slots.lock()
            .get_mut(&member.id)
            .and_then(|slot| slot.idle.pop())
    }

    /// Check out a connection for a member
    pub async fn take(&self, member: &Member) -> Result<PooledConnection<F::Connection>> {
        let permits = self.permits(member);
        let permit = match tokio::time::timeout(self.acquire_timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) | Err(_) => {
                tracing::debug!("Pool for {} exhausted, connecting directly", member);
                None
            }
        };

        if permit.is_some() {
            while let Some(mut idle) = self.pop_idle(member) {
                if self.factory.validate(&mut idle).await {
                    return Ok(PooledConnection {
                        connection: idle,
                        member_id: member.id.clone(),
                        permit,
                    });
                }
                tracing::debug!("Discarding stale connection to {}", member);
                self.factory.destroy(idle).await;
            }
        }

        let connection = self.factory.create(member).await?;
        Ok(PooledConnection {
            connection,
            member_id: member.id.clone(),
            permit,
        })
    }

    /// Return a connection. Direct connections and ones that fail validation
    /// are destroyed.
    pub async fn release(&self, pooled: PooledConnection<F::Connection>) {
        let PooledConnection {
            mut connection,
            member_id,
            permit,
        } = pooled;

        if permit.is_none() || !self.factory.validate(&mut connection).await {
            self.factory.destroy(connection).await;
            return;
        }

        // Member closed while the connection was out
        let orphan = match self.slots.lock().get_mut(&member_id) {
            Some(slot) => {
                slot.idle.push(connection);
                None
            }
            None => Some(connection),
        };
        drop(permit);
        if let Some(connection) = orphan {
            self.factory.destroy(connection).await;
        }
    }

    /// Idle connections held for a member
    pub fn idle(&self, member_id: &str) -> usize {
        self.slots.lock()
            .get(member_id)
            .map_or(0, |slot| slot.idle.len())
    }

    /// Destroy a member's idle connections and forget the member
    pub async fn close_member(&self, member_id: &str) {
        let idle = self.slots.lock()
            .remove(member_id)
            .map(|slot| slot.idle)
            .unwrap_or_default();
        for connection in idle {
            self.factory.destroy(connection).await;
        }
    }

    /// Destroy every idle connection
    pub async fn close(&self) {
        let drained: Vec<F::Connection> = self.slots.lock()
            .drain()
            .flat_map(|(_, slot)| slot.idle)
            .collect();
        tracing::debug!("Closing {} pooled connections", drained.len());
        for connection in drained {
            self.factory.destroy(connection).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for Counting {
        type Connection = usize;

        async fn create(&self, _member: &Member) -> Result<usize> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, connection: &mut usize) -> bool {
            // Odd-numbered connections go stale
            *connection % 2 == 0
        }

        async fn destroy(&self, _connection: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize) -> MemberPool<Counting> {
        MemberPool::new(Counting::default(), max, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = pool(2);
        let db1 = Member::new("db1", "");

        let conn = pool.take(&db1).await.unwrap();
        assert_eq!(*conn, 0);
        pool.release(conn).await;
        assert_eq!(pool.idle("db1"), 1);

        let again = pool.take(&db1).await.unwrap();
        assert_eq!(*again, 0);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_connects_directly() {
        let pool = pool(1);
        let db1 = Member::new("db1", "");

        let first = pool.take(&db1).await.unwrap();
        let second = pool.take(&db1).await.unwrap();
        assert!(first.is_pooled());
        assert!(!second.is_pooled());

        pool.release(second).await;
        assert_eq!(pool.idle("db1"), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
        pool.release(first).await;
        assert_eq!(pool.idle("db1"), 1);
    }

    #[tokio::test]
    async fn test_invalid_connection_is_destroyed() {
        let pool = pool(2);
        let db1 = Member::new("db1", "");

        let even = pool.take(&db1).await.unwrap();
        let odd = pool.take(&db1).await.unwrap();
        pool.release(odd).await;
        pool.release(even).await;
        assert_eq!(pool.idle("db1"), 1);

        pool.close().await;
        assert_eq!(pool.idle("db1"), 0);
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    }
}
