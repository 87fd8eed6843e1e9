//! Lock Server
//!
//! Accepts lock commands from peers and applies them to the local
//! [`RemoteLockRegistry`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};
use crate::lock::RemoteLockRegistry;

/// TCP server for lock peers
pub struct LockServer {
    listener: TcpListener,
    registry: Arc<RemoteLockRegistry>,
    shutdown: watch::Sender<bool>,
}

impl LockServer {
    /// Bind the listening socket
    pub async fn bind(address: &str, registry: Arc<RemoteLockRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until [`LockServer::stop`] is called
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Lock server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let peer_addr = addr.to_string();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, registry).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.registry.shutdown();
        tracing::info!("Lock server stopped");
        Ok(())
    }

    /// Stop accepting and drop every lock held for peers
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    registry: Arc<RemoteLockRegistry>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

        let command = match message {
            Message::Command(command) => command,
            other => {
                let reply = Message::Error {
                    message: format!("unexpected {}", other.type_name()),
                };
                write_message(&mut writer, &reply).await?;
                continue;
            }
        };

        let undo = command.undo();
        // A requester that hangs up mid-wait no longer wants the lock
        let granted = tokio::select! {
            granted = registry.handle(command) => granted,
            _ = closed(&mut reader) => {
                tracing::debug!("{} disconnected while waiting for a lock", peer_addr);
                break;
            }
        };

        if let Err(e) = write_message(&mut writer, &Message::Reply { granted }).await {
            if let (true, Some(release)) = (granted, undo) {
                registry.handle(release).await;
            }
            return Err(e);
        }
    }

    Ok(())
}

/// Resolves once the peer has closed its side of the connection
async fn closed(reader: &mut OwnedReadHalf) {
    let mut byte = [0u8; 1];
    match reader.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        // A pipelined request is pending; keep waiting for the current one
        Ok(_) => std::future::pending::<()>().await,
    }
}
