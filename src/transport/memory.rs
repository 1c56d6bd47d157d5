//! In-process bus
//!
//! A cloneable hub connecting every storage instance of one process (or
//! of one test). Each clone shares the same subscriber table; broadcasts
//! reach every subscriber of the topic, the sender included.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Bus, Subscribers, Subscription};
use crate::error::{Error, Result};

/// Shared in-memory bus
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<RwLock<Subscribers>>,
    partitioned: Arc<std::sync::atomic::AtomicBool>,
}

impl LocalBus {
    /// Create a new, empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every broadcast fail until healed
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned
            .store(partitioned, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of live subscribers of `topic`
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().await.count(topic)
    }
}

#[async_trait::async_trait]
impl Bus for LocalBus {
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.partitioned.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Transport(format!("bus partitioned, dropped message on {}", topic)));
        }
        let delivered = self.subscribers.write().await.deliver(topic, &payload);
        tracing::trace!("Delivered {} bytes on {} to {} subscribers", payload.len(), topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        Ok(self.subscribers.write().await.add(topic))
    }
}
