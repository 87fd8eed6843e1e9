//! MySQL/MariaDB Backend
//!
//! Executes statements on one member at a time through a [`MemberPool`] of
//! sqlx connections.

use std::collections::HashSet;
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use sqlx::{Connection, MySqlConnection};

use crate::config::PoolConfig;
use crate::error::{Error, ErrorKind, ExceptionFactory, Result};
use crate::invocation::Invoker;
use crate::member::Member;
use crate::pool::{ConnectionFactory, MemberPool};

/// Opens sqlx connections to the member's URL
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

#[async_trait]
impl ConnectionFactory for MySqlConnector {
    type Connection = MySqlConnection;

    async fn create(&self, member: &Member) -> Result<MySqlConnection> {
        MySqlConnection::connect(&member.url)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: member.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn validate(&self, connection: &mut MySqlConnection) -> bool {
        connection.ping().await.is_ok()
    }

    async fn destroy(&self, connection: MySqlConnection) {
        if let Err(e) = connection.close().await {
            tracing::debug!("Error closing connection: {}", e);
        }
    }
}

/// Statement execution against members
pub struct MySqlBackend {
    pool: Option<MemberPool<MySqlConnector>>,
    /// Members a mock backend fails on
    mock_failures: Mutex<HashSet<String>>,
}

impl MySqlBackend {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            pool: Some(MemberPool::new(
                MySqlConnector,
                config.max_connections,
                Duration::from_millis(config.acquire_timeout_ms),
            )),
            mock_failures: Mutex::new(HashSet::new()),
        }
    }

    /// Create a mock backend for testing
    pub fn new_mock() -> Self {
        Self {
            pool: None,
            mock_failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.pool.is_none()
    }

    /// Make a mock backend fail every statement on a member
    pub fn fail_member(&self, member_id: &str) {
        self.mock_failures.lock().insert(member_id.to_string());
    }

    fn mock_result(&self, member: &Member) -> Result<u64> {
        if self.mock_failures.lock().contains(&member.id) {
            return Err(Error::ConnectionFailed {
                address: member.id.clone(),
                reason: "mock failure".into(),
            });
        }
        Ok(0)
    }

    /// Execute a statement on one member, returning rows affected
    pub async fn execute(&self, member: &Member, sql: &str) -> Result<u64> {
        let Some(pool) = &self.pool else {
            return self.mock_result(member);
        };

        tracing::debug!("Executing on {}: {}", member, preview(sql));
        let mut conn = pool.take(member).await?;
        let result = sqlx::query(sql).execute(&mut *conn).await;
        pool.release(conn).await;

        Ok(result?.rows_affected())
    }

    /// Check if a member answers
    pub async fn health_check(&self, member: &Member) -> Result<bool> {
        let Some(pool) = &self.pool else {
            return Ok(self.mock_result(member).is_ok());
        };

        let mut conn = pool.take(member).await?;
        let result: std::result::Result<(i32,), sqlx::Error> =
            sqlx::query_as("SELECT 1").fetch_one(&mut *conn).await;
        pool.release(conn).await;

        Ok(result?.0 == 1)
    }

    /// Invoker running `sql` on whichever member it is dispatched to
    pub fn statement(self: &Arc<Self>, sql: impl Into<String>) -> Arc<dyn Invoker<u64>> {
        Arc::new(StatementInvoker {
            backend: Arc::clone(self),
            sql: sql.into(),
        })
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

/// One statement bound to a backend
pub struct StatementInvoker {
    backend: Arc<MySqlBackend>,
    sql: String,
}

#[async_trait]
impl Invoker<u64> for StatementInvoker {
    async fn invoke(&self, member: &Member) -> Result<u64> {
        self.backend.execute(member, &self.sql).await
    }
}

/// Classifies server errors by SQLSTATE: connection exceptions (class `08`)
/// mean the member is unusable, anything else the server reports is a fault
/// of the statement and would recur on every member.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlExceptionFactory;

impl SqlExceptionFactory {
    fn classify_sqlstate(sqlstate: &str) -> ErrorKind {
        if sqlstate.starts_with("08") {
            ErrorKind::MemberFailure
        } else {
            ErrorKind::ClusterFatal
        }
    }
}

impl ExceptionFactory for SqlExceptionFactory {
    fn id(&self) -> &'static str {
        "sql"
    }

    fn classify(&self, error: &Error) -> ErrorKind {
        match error {
            Error::Database(sqlx::Error::Database(db)) => match db.code() {
                Some(code) => Self::classify_sqlstate(&code),
                None => ErrorKind::ClusterFatal,
            },
            other => other.kind(),
        }
    }
}
