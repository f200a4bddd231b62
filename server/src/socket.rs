//! Transport seam between the room server and whatever owns the real
//! WebSocket.
//!
//! The accept loop and frame parsing live outside this crate. What the core
//! consumes is the write half of one connection: a bounded command channel
//! the transport drains into actual frames. [`crate::ws`] is the shipped
//! actix binding; tests drain the receiver directly.

use tokio::sync::mpsc;

const SOCKET_BUFFER: usize = 64;

/// Outbound instruction for the transport driving one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    /// Deliver a text frame verbatim.
    Text(String),
    /// Send a WebSocket ping probe.
    Ping,
    /// Close the connection. The transport reports back through
    /// `RoomServer::connection_closed` once the socket is actually gone.
    Close,
}

#[derive(Debug, thiserror::Error)]
#[error("socket closed")]
pub struct SocketClosed;

/// Write half of one client connection. Owned exclusively by the Client it
/// is admitted with; nothing else writes to the socket.
#[derive(Debug)]
pub struct SocketHandle {
    tx: mpsc::Sender<SocketCommand>,
}

impl SocketHandle {
    /// Create a handle and the receiver the transport drains.
    pub fn channel() -> (SocketHandle, mpsc::Receiver<SocketCommand>) {
        let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
        (SocketHandle { tx }, rx)
    }

    pub(crate) async fn send(&self, text: String) -> Result<(), SocketClosed> {
        self.tx
            .send(SocketCommand::Text(text))
            .await
            .map_err(|_| SocketClosed)
    }

    /// Probes are droppable under back-pressure; only a gone peer is an
    /// error.
    pub(crate) fn ping(&self) -> Result<(), SocketClosed> {
        match self.tx.try_send(SocketCommand::Ping) {
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SocketClosed),
            _ => Ok(()),
        }
    }

    pub(crate) async fn close(&self) {
        let _ = self.tx.send(SocketCommand::Close).await;
    }
}
