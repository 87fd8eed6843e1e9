//! Child Object Recording
//!
//! Operations such as opening a large-object locator hand back a stateful
//! child object per member. Every mutating call on the child is recorded so
//! that a member joining later can be advanced through the same sequence and
//! end up in the same observable state.
//!
//! The set of replayable calls is closed: each is a [`ChildCall`] variant and
//! [`ChildCall::apply`] is the dispatch table onto a [`ChildHandle`].

mod proxy;

pub use proxy::ChildProxy;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A recorded call on a child object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildCall {
    /// Append at the current end
    Write(Bytes),
    /// Overwrite starting at a zero-based offset, extending if needed
    SetBytes { position: u64, data: Bytes },
    /// Cut to the given length
    Truncate(u64),
    Flush,
    /// Release the underlying resource. Always the last call.
    Close,
}

impl ChildCall {
    pub fn name(&self) -> &'static str {
        match self {
            ChildCall::Write(_) => "write",
            ChildCall::SetBytes { .. } => "set_bytes",
            ChildCall::Truncate(_) => "truncate",
            ChildCall::Flush => "flush",
            ChildCall::Close => "close",
        }
    }

    /// Perform this call on a handle
    pub async fn apply<H: ChildHandle + ?Sized>(&self, handle: &mut H) -> Result<()> {
        match self {
            ChildCall::Write(data) => handle.write(data).await,
            ChildCall::SetBytes { position, data } => handle.set_bytes(*position, data).await,
            ChildCall::Truncate(len) => handle.truncate(*len).await,
            ChildCall::Flush => handle.flush().await,
            ChildCall::Close => handle.close().await,
        }
    }
}

/// A child object bound to one member (an output sink, a locator, ...)
#[async_trait]
pub trait ChildHandle: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    async fn set_bytes(&mut self, position: u64, data: &[u8]) -> Result<()>;

    async fn truncate(&mut self, len: u64) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Ordered log of the calls made on one child object
#[derive(Debug, Clone, Default)]
pub struct InvocationRecorder {
    calls: Vec<ChildCall>,
    closed: bool,
}

impl InvocationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call. Nothing may follow `Close`.
    pub fn record(&mut self, call: ChildCall) -> Result<()> {
        if self.closed {
            return Err(Error::Internal(format!(
                "{} recorded after close",
                call.name()
            )));
        }
        self.closed = call == ChildCall::Close;
        self.calls.push(call);
        Ok(())
    }

    /// Apply every recorded call, in order, to a fresh handle
    pub async fn replay<H: ChildHandle + ?Sized>(&self, handle: &mut H) -> Result<()> {
        for (index, call) in self.calls.iter().enumerate() {
            tracing::trace!("Replaying call {} ({})", index, call.name());
            call.apply(handle).await?;
        }
        Ok(())
    }

    pub fn calls(&self) -> &[ChildCall] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// In-memory byte sink, used to exercise recording
#[cfg(test)]
pub(crate) mod memory {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub struct MemoryHandle {
        pub data: Vec<u8>,
        pub flushes: usize,
        pub closed: bool,
        /// Fail every call once this many have succeeded
        pub fail_after: Option<usize>,
        calls: usize,
    }

    impl MemoryHandle {
        pub fn failing_after(calls: usize) -> Self {
            Self {
                fail_after: Some(calls),
                ..Self::default()
            }
        }

        /// State visible to a client, ignoring fault injection
        pub fn observable(&self) -> (Vec<u8>, usize, bool) {
            (self.data.clone(), self.flushes, self.closed)
        }

        fn check(&mut self) -> Result<()> {
            if self.closed {
                return Err(Error::Internal("handle closed".into()));
            }
            if self.fail_after.is_some_and(|n| self.calls >= n) {
                return Err(Error::member("memory", "handle broken"));
            }
            self.calls += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl ChildHandle for MemoryHandle {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.check()?;
            self.data.extend_from_slice(data);
            Ok(())
        }

        async fn set_bytes(&mut self, position: u64, data: &[u8]) -> Result<()> {
            self.check()?;
            let start = position as usize;
            let end = start + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[start..end].copy_from_slice(data);
            Ok(())
        }

        async fn truncate(&mut self, len: u64) -> Result<()> {
            self.check()?;
            self.data.truncate(len as usize);
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            self.check()?;
            self.flushes += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.check()?;
            self.closed = true;
            Ok(())
        }
    }
}
