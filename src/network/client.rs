//! Lock Client
//!
//! [`CommandChannel`] over TCP. Idle connections are kept per peer; a
//! connection is checked out for exactly one exchange and only returned once
//! the reply has been read, so an abandoned request never leaves a stale
//! reply on a pooled connection.

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};
use crate::lock::{CommandChannel, LockCommand};

/// TCP command channel to lock peers
pub struct TcpCommandChannel {
    /// address -> idle connections
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    connect_timeout: Duration,
    /// Reserved for the round trip on top of an acquire command's own wait
    request_timeout: Duration,
}

impl TcpCommandChannel {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message and wait for the reply.
    ///
    /// The whole request, connecting included, must finish within
    /// `request_timeout + wait`. An acquire command's wait is shortened to
    /// what is left of that budget once a connection is in hand, so the peer
    /// always gives up before the requester does.
    pub async fn request(&self, address: &str, mut message: Message, wait: Duration) -> Result<Message> {
        let deadline = Instant::now() + self.request_timeout + wait;
        match timeout_at(deadline, self.request_inner(address, &mut message, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn request_inner(&self, address: &str, message: &mut Message, deadline: Instant) -> Result<Message> {
        if let Some(mut stream) = self.take_idle(address).await {
            self.fit_wait(message, deadline);
            match exchange(&mut stream, message).await {
                Ok(reply) => {
                    self.put_idle(address, stream).await;
                    return Ok(reply);
                }
                Err(e) => tracing::debug!("Pooled connection to {} failed: {}", address, e),
            }
        }

        let mut stream = self.connect(address).await?;
        self.fit_wait(message, deadline);
        let reply = exchange(&mut stream, message).await?;
        self.put_idle(address, stream).await;
        Ok(reply)
    }

    /// Cap an acquire's wait at the budget left before `deadline`
    fn fit_wait(&self, message: &mut Message, deadline: Instant) {
        if let Message::Command(LockCommand::Acquire { timeout_ms, .. }) = message {
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .saturating_sub(self.request_timeout);
            *timeout_ms = (*timeout_ms).min(budget.as_millis() as u64);
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn take_idle(&self, address: &str) -> Option<TcpStream> {
        self.idle.lock().await.get_mut(address).and_then(Vec::pop)
    }

    async fn put_idle(&self, address: &str, stream: TcpStream) {
        self.idle
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .push(stream);
    }

    /// Idle connections across all peers
    pub async fn connection_count(&self) -> usize {
        self.idle.lock().await.values().map(Vec::len).sum()
    }

    pub async fn close_all(&self) {
        self.idle.lock().await.clear();
    }
}

async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

#[async_trait]
impl CommandChannel for TcpCommandChannel {
    async fn send(&self, node: &str, command: LockCommand) -> Result<bool> {
        let wait = match &command {
            LockCommand::Acquire { timeout_ms, .. } => Duration::from_millis(*timeout_ms),
            LockCommand::Release { .. } => Duration::ZERO,
        };
        match self.request(node, Message::Command(command), wait).await? {
            Message::Reply { granted } => Ok(granted),
            Message::Error { message } => Err(Error::Network(format!("{}: {}", node, message))),
            other => Err(Error::Network(format!(
                "{} answered with {}",
                node,
                other.type_name()
            ))),
        }
    }
}
