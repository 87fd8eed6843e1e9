//! Invocation Module
//!
//! Executes an operation against cluster members and consolidates the
//! per-member outcomes.

mod strategy;

pub use strategy::InvocationStrategy;

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::Result;
use crate::member::Member;

/// Per-member results keyed by member id
pub type Results<R> = BTreeMap<String, R>;

/// Executes one operation against one member
#[async_trait]
pub trait Invoker<R: Send>: Send + Sync {
    async fn invoke(&self, member: &Member) -> Result<R>;
}

/// Adapts a closure returning a boxed future into an [`Invoker`]
pub struct FnInvoker<F> {
    f: F,
}

impl<F> FnInvoker<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<R, F> Invoker<R> for FnInvoker<F>
where
    R: Send + 'static,
    F: Fn(Member) -> BoxFuture<'static, Result<R>> + Send + Sync,
{
    async fn invoke(&self, member: &Member) -> Result<R> {
        (self.f)(member.clone()).await
    }
}

/// Wrap a closure as a shared invoker
pub fn invoker_fn<R, F>(f: F) -> Arc<dyn Invoker<R>>
where
    R: Send + 'static,
    F: Fn(Member) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
{
    Arc::new(FnInvoker::new(f))
}

/// Idempotency class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Does not change member state
    Read,
    /// Changes data on every member
    Write,
    /// Changes schema; requires the global write lock
    Structural,
}

/// Shape of a unit of work dispatched to the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Named object the operation serializes on (e.g. a sequence)
    pub lock_name: Option<String>,
    /// Whether the operation hands back a stateful child object
    pub returns_child: bool,
}

impl Operation {
    pub fn read() -> Self {
        Self {
            kind: OperationKind::Read,
            lock_name: None,
            returns_child: false,
        }
    }

    pub fn write() -> Self {
        Self {
            kind: OperationKind::Write,
            lock_name: None,
            returns_child: false,
        }
    }

    pub fn structural() -> Self {
        Self {
            kind: OperationKind::Structural,
            lock_name: None,
            returns_child: false,
        }
    }

    /// Classify a SQL statement through the dialect
    pub fn for_sql(dialect: &dyn Dialect, sql: &str) -> Self {
        let kind = if dialect.is_structural(sql) {
            OperationKind::Structural
        } else if dialect.is_read_only(sql) {
            OperationKind::Read
        } else {
            OperationKind::Write
        };
        Self {
            kind,
            lock_name: dialect.lock_name(sql),
            returns_child: false,
        }
    }

    pub fn returning_child(mut self) -> Self {
        self.returns_child = true;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == OperationKind::Read
    }
}
