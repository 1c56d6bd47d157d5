//! Transport Module
//!
//! The bus abstraction replication runs on, plus two adapters: an
//! in-process hub and a framed byte stream.

mod memory;
mod stream;

pub use memory::LocalBus;
pub use stream::{Frame, FrameCodec, FrameHeader, StreamBus};

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Receiving side of a topic subscription. Dropping it unsubscribes.
pub type Subscription = mpsc::UnboundedReceiver<Bytes>;

/// Generic message bus between the processes of a cluster
///
/// Delivery is assumed reliable and ordered per sender; delivery back to
/// the sender may or may not happen.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    /// Send `payload` to every subscriber of `topic`
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `topic`
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Per-topic subscriber lists shared by the adapters
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    topics: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl Subscribers {
    /// Register a new subscriber for `topic`
    pub(crate) fn add(&mut self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Deliver `payload` to live subscribers of `topic`, dropping closed ones.
    /// Returns the number of deliveries.
    pub(crate) fn deliver(&mut self, topic: &str, payload: &Bytes) -> usize {
        let Some(senders) = self.topics.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            self.topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscribers of `topic`
    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
