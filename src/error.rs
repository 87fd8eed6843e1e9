//! WolfHA Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every error the cluster can produce.
///
/// Member-level failures are absorbed by deactivating the member; the other
/// kinds surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// One backend errored or timed out
    MemberFailure,
    /// Every member failed, or surviving members disagree
    ClusterFatal,
    /// A lock could not be acquired in time (or acquisition was interrupted)
    LockTimeout,
    /// The state store could not record a transition
    Persistence,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::MemberFailure => write!(f, "member-failure"),
            ErrorKind::ClusterFatal => write!(f, "cluster-fatal"),
            ErrorKind::LockTimeout => write!(f, "lock-timeout"),
            ErrorKind::Persistence => write!(f, "persistence-failure"),
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "member-failure" => Ok(ErrorKind::MemberFailure),
            "cluster-fatal" => Ok(ErrorKind::ClusterFatal),
            "lock-timeout" => Ok(ErrorKind::LockTimeout),
            "persistence-failure" => Ok(ErrorKind::Persistence),
            other => Err(Error::StateCorrupted(format!("unknown error kind '{}'", other))),
        }
    }
}

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unknown {kind} '{id}'")]
    UnknownFactory { kind: &'static str, id: String },

    // Member errors
    #[error("Member {member} failed: {reason}")]
    MemberFailure { member: String, reason: String },

    #[error("Replay onto member {member} failed: {reason}")]
    Replay { member: String, reason: String },

    // Cluster errors
    #[error("Cluster has no active members")]
    NoActiveMembers,

    #[error("Inconsistent results across members: {0}")]
    InconsistentResults(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    // Lock errors
    #[error("Timed out acquiring lock {0}")]
    LockTimeout(String),

    #[error("Interrupted while acquiring lock {0}")]
    LockInterrupted(String),

    // Durability errors
    #[error("Invalid transaction identifier: {0}")]
    InvalidTransactionId(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State corrupted: {0}")]
    StateCorrupted(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MemberFailure { .. }
            | Error::Replay { .. }
            | Error::QueryExecution(_)
            | Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::Io(_) => ErrorKind::MemberFailure,

            Error::Database(e) => match e {
                sqlx::Error::Database(_)
                | sqlx::Error::RowNotFound
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::TypeNotFound { .. } => ErrorKind::ClusterFatal,
                _ => ErrorKind::MemberFailure,
            },

            Error::LockTimeout(_) | Error::LockInterrupted(_) => ErrorKind::LockTimeout,

            Error::State(_) | Error::StateCorrupted(_) => ErrorKind::Persistence,

            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::UnknownFactory { .. }
            | Error::NoActiveMembers
            | Error::InconsistentResults(_)
            | Error::InvalidTransactionId(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::ClusterFatal,
        }
    }

    /// Check if this error is retryable (local to a single member)
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::MemberFailure
    }

    /// Wrap an arbitrary failure as a member-level error
    pub fn member(member: &str, reason: impl std::fmt::Display) -> Self {
        Error::MemberFailure {
            member: member.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Classification hook consulted by the invocation layer.
///
/// Lets a backend map its native errors onto [`ErrorKind`] so callers can tell
/// member-local failures from structural ones.
pub trait ExceptionFactory: Send + Sync {
    /// Identifier persisted with durability events
    fn id(&self) -> &'static str;

    /// Classify an error
    fn classify(&self, error: &Error) -> ErrorKind {
        error.kind()
    }

    /// Whether the error indicates the member itself is unusable
    fn is_member_failure(&self, error: &Error) -> bool {
        self.classify(error) == ErrorKind::MemberFailure
    }
}

/// Classification straight from [`Error::kind`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionFactory;

impl ExceptionFactory for DefaultExceptionFactory {
    fn id(&self) -> &'static str {
        "default"
    }
}
