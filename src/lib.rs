//! WolfHA - High-Availability Clustering for MariaDB/MySQL
//!
//! Makes a set of independent database backends behave as one highly
//! available database. Every operation issued against the cluster is
//! replayed on each live member; members that fail or diverge are taken out
//! of rotation, and operations interrupted by a crash are detected and
//! resolved on the next start.
//!
//! # Architecture
//!
//! - [`balancer`]: the active member set and routing policy
//! - [`invocation`]: fan-out of an operation across members and
//!   reconciliation of their outcomes
//! - [`durability`]: persisted before/after events around each dispatch and
//!   crash recovery from them
//! - [`recorder`]: record/replay of calls on child objects returned by an
//!   operation
//! - [`lock`]: global and per-object locks, local or shared with peer nodes
//! - [`state`]: durable membership and durability event storage
//!
//! [`cluster::DatabaseCluster`] ties these together.

pub mod config;
pub mod error;
pub mod member;
pub mod balancer;
pub mod dialect;
pub mod invocation;
pub mod durability;
pub mod recorder;
pub mod lock;
pub mod state;
pub mod pool;
pub mod executor;
pub mod network;
pub mod cluster;

pub use config::WolfHaConfig;
pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::balancer::{Balancer, BalancerKind};
    pub use crate::cluster::{ClusterTransaction, DatabaseCluster};
    pub use crate::config::WolfHaConfig;
    pub use crate::durability::{DurabilityLevel, Phase, TransactionId};
    pub use crate::error::{Error, ErrorKind, ExceptionFactory, Result};
    pub use crate::invocation::{invoker_fn, InvocationStrategy, Invoker, Results};
    pub use crate::lock::{LockDescriptor, LockManager};
    pub use crate::member::Member;
    pub use crate::recorder::{ChildCall, ChildHandle, ChildProxy};
    pub use crate::state::StateManager;
}
