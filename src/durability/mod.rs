//! Durability Module
//!
//! Brackets cluster invocations with persisted before/after events so that a
//! crash in the middle of an operation can be detected on restart and the
//! possibly-inconsistent members deactivated.
//!
//! Per transaction the phases run `INVOKE -> [PREPARE] -> COMMIT | ROLLBACK
//! -> FORGET`. An [`InvocationEvent`] is opened before dispatch and closed
//! after every member call has finished; [`InvokerEvent`]s for the individual
//! member calls (fine level only) live strictly inside that window.

mod id;
mod tracker;
mod recovery;

pub use id::TransactionId;
pub use tracker::{DurabilityTracker, DurableStrategy, DurableInvoker, DEFAULT_IN_FLIGHT_CAPACITY};
pub use recovery::RecoveryReport;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// How much of an invocation is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityLevel {
    /// Nothing is tracked; a mid-operation crash must be resolved by hand
    None,
    /// Invocation-level events; recovery deactivates every backup
    Coarse,
    /// Invocation and per-member events; recovery deactivates only members
    /// that did not confirm completion
    Fine,
}

impl DurabilityLevel {
    pub fn id(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "none",
            DurabilityLevel::Coarse => "coarse",
            DurabilityLevel::Fine => "fine",
        }
    }

    pub fn tracks_invocations(&self) -> bool {
        !matches!(self, DurabilityLevel::None)
    }

    pub fn tracks_invokers(&self) -> bool {
        matches!(self, DurabilityLevel::Fine)
    }
}

impl std::str::FromStr for DurabilityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DurabilityLevel::None),
            "coarse" => Ok(DurabilityLevel::Coarse),
            "fine" => Ok(DurabilityLevel::Fine),
            other => Err(Error::UnknownFactory {
                kind: "durability",
                id: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Coarse stage of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Invoke,
    Prepare,
    Commit,
    Rollback,
    Forget,
}

impl Phase {
    /// Stable numeric id used in persisted state
    pub fn id(&self) -> u8 {
        match self {
            Phase::Invoke => 0,
            Phase::Prepare => 1,
            Phase::Commit => 2,
            Phase::Rollback => 3,
            Phase::Forget => 4,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Phase::Invoke),
            1 => Ok(Phase::Prepare),
            2 => Ok(Phase::Commit),
            3 => Ok(Phase::Rollback),
            4 => Ok(Phase::Forget),
            other => Err(Error::StateCorrupted(format!("unknown durability phase {}", other))),
        }
    }

    /// Whether `self` may follow `previous` for the same transaction
    pub fn may_follow(&self, previous: Option<Phase>) -> bool {
        match (previous, self) {
            (None, Phase::Invoke) => true,
            (Some(Phase::Invoke), Phase::Invoke) => true,
            (Some(Phase::Invoke), Phase::Prepare | Phase::Commit | Phase::Rollback) => true,
            (Some(Phase::Prepare), Phase::Commit | Phase::Rollback) => true,
            (Some(Phase::Commit | Phase::Rollback), Phase::Forget) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Invoke => write!(f, "INVOKE"),
            Phase::Prepare => write!(f, "PREPARE"),
            Phase::Commit => write!(f, "COMMIT"),
            Phase::Rollback => write!(f, "ROLLBACK"),
            Phase::Forget => write!(f, "FORGET"),
        }
    }
}

/// {transaction, phase}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurabilityEvent {
    pub transaction_id: TransactionId,
    pub phase: Phase,
}

impl DurabilityEvent {
    pub fn new(transaction_id: TransactionId, phase: Phase) -> Self {
        Self { transaction_id, phase }
    }
}

impl std::fmt::Display for DurabilityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.phase, self.transaction_id)
    }
}

/// Invocation-level event, tagged with the exception factory that classifies
/// its member outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub event: DurabilityEvent,
    pub classification: String,
}

impl InvocationEvent {
    pub fn new(transaction_id: TransactionId, phase: Phase, classification: impl Into<String>) -> Self {
        Self {
            event: DurabilityEvent::new(transaction_id, phase),
            classification: classification.into(),
        }
    }
}

/// Outcome captured for a single member call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokerOutcome {
    Success,
    Failure(ErrorKind),
}

/// Member-level event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerEvent {
    pub event: DurabilityEvent,
    pub member_id: String,
    /// `None` until the member call completes
    pub outcome: Option<InvokerOutcome>,
}

impl InvokerEvent {
    pub fn new(event: DurabilityEvent, member_id: impl Into<String>) -> Self {
        Self {
            event,
            member_id: member_id.into(),
            outcome: None,
        }
    }

    pub fn completed(&self) -> bool {
        self.outcome == Some(InvokerOutcome::Success)
    }
}
