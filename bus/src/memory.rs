//! In-process bus for tests and single-process clusters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Bus, BusError, BusMessage, Subscription};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Routes messages between subscribers over tokio channels. Delivery is
/// per-publisher FIFO; a subscriber whose buffer is full loses the message
/// (slow consumers are not a back-pressure source for the fleet).
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    inbox_seq: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, message: BusMessage) {
        let mut topics = self.topics.lock().unwrap();
        let Some(senders) = topics.get_mut(&message.subject) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subject = %message.subject, "slow bus subscriber, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            topics.remove(&message.subject);
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_inbox.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed));
        let mut replies = self.subscribe(&inbox).await?;
        self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(inbox.clone()),
        });

        let outcome = tokio::time::timeout(timeout, replies.recv()).await;
        self.topics.lock().unwrap().remove(&inbox);
        match outcome {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::RequestTimeout(timeout)),
        }
    }
}
