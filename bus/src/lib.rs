//! Topic-bus abstraction the room servers and discovery nodes communicate
//! over.
//!
//! The core only ever needs three primitives: fire-and-forget publish,
//! subject subscription, and a single-reply request. That is the whole
//! [`Bus`] trait. Adapters for external brokers implement it by shuttling
//! [`BusMessage`]s into a [`Subscription`] channel; [`MemoryBus`] is the
//! in-process implementation used by tests and single-process clusters.
//!
//! Subject matching is exact. Replies travel NATS-style: a request carries a
//! generated reply-to subject in [`BusMessage::reply`], and the responder
//! publishes its answer there.

pub mod memory;

pub use memory::MemoryBus;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("no reply within {0:?}")]
    RequestTimeout(Duration),
}

/// One delivered message. `reply` is set when the publisher expects a
/// single answer published back on that subject.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub reply: Option<String>,
}

/// Stream of messages for one subject. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Wrap a delivery channel. Exposed so external broker adapters can
    /// construct subscriptions.
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Publish and wait for the first reply. Exactly one reply is consumed;
    /// any further responders go unheard.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;
}
