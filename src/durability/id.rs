//! Transaction Identifiers
//!
//! Durability correlation keys. Each identifier is a random 128-bit value with
//! a fixed 16-byte encoding used both by the state store and by the lock
//! transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Globally unique transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Generate a new random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fixed-size byte encoding
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        *self.0.as_bytes()
    }

    /// Decode from exactly [`TransactionId::SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; Self::SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidTransactionId(format!(
                "expected {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(Uuid::from_bytes(bytes)))
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
