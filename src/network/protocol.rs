//! Lock Wire Protocol
//!
//! Messages exchanged between lock peers, framed with a length and CRC32
//! header and encoded with bincode.

use serde::{Deserialize, Serialize};

use crate::lock::LockCommand;

/// Protocol messages between lock peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request from a lock client
    Command(LockCommand),

    /// Outcome of a command
    Reply { granted: bool },

    /// The peer could not process the request
    Error { message: String },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Command(command) => command.type_name(),
            Message::Reply { .. } => "Reply",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header: body length and checksum, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    /// Upper bound on a frame body; lock traffic is tiny
    pub const MAX_LENGTH: u32 = 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
