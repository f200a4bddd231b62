//! A single connected end-user.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use roomcast_protocol::ClientSummary;
use serde_json::Value;

use crate::socket::{SocketClosed, SocketHandle};

/// One end-user on this room server. Owns the write half of its socket and
/// cannot outlive it; `properties` are fixed at connect time.
#[derive(Debug)]
pub struct Client {
    id: String,
    properties: Option<Value>,
    socket: SocketHandle,
    missed_pings: Arc<AtomicU32>,
}

impl Client {
    pub(crate) fn new(id: String, properties: Option<Value>, socket: SocketHandle) -> Self {
        Self {
            id,
            properties,
            socket,
            missed_pings: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> Option<&Value> {
        self.properties.as_ref()
    }

    /// The only shape of a client exposed beyond its room server.
    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Counter shared with the transport session so a pong can reset it.
    pub(crate) fn missed_pings_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.missed_pings)
    }

    pub(crate) fn missed_pings(&self) -> u32 {
        self.missed_pings.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_missed_ping(&self) {
        self.missed_pings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) async fn send(&self, text: String) -> Result<(), SocketClosed> {
        self.socket.send(text).await
    }

    pub(crate) fn ping(&self) -> Result<(), SocketClosed> {
        self.socket.ping()
    }

    pub(crate) async fn disconnect(&self) {
        self.socket.close().await;
    }
}
