//! Replication Channel
//!
//! Outbound: local mutations are queued on a bounded channel and broadcast
//! by a worker task, so callers never wait on the network. Inbound: bus
//! payloads are decoded, filtered to this store, stripped of our own echo
//! and of duplicate deliveries, and handed to the owner in bus order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::protocol::{topic_for, Envelope, Message, Origin};
use crate::error::{Error, Result};
use crate::store::lock;
use crate::transport::{Bus, Subscription};

/// Sending half of a store's replication binding
pub struct ReplicationChannel {
    store: String,
    origin: Origin,
    clock: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationChannel {
    /// Subscribe to the store's topic on `bus` and start the outbound worker
    pub async fn attach(
        bus: Arc<dyn Bus>,
        store: &str,
        origin: Origin,
        queue_capacity: usize,
    ) -> Result<(Self, Inbound)> {
        let topic = topic_for(store);
        let subscription = bus.subscribe(&topic).await?;

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = tokio::spawn(outbound_worker(bus, topic, store.to_string(), rx));

        let channel = Self {
            store: store.to_string(),
            origin: origin.clone(),
            clock: AtomicU64::new(0),
            outbound: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        };
        let inbound = Inbound::new(store, origin, subscription);

        tracing::debug!("Replication attached for '{}' as {}", store, channel.origin);
        Ok((channel, inbound))
    }

    /// This instance's origin
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Next application-order hint
    pub fn next_timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a message without waiting. A full queue or a detached channel
    /// drops the message with a warning.
    pub fn publish(&self, message: Message) {
        let guard = lock(&self.outbound);
        let Some(tx) = guard.as_ref() else {
            tracing::debug!("'{}' detached, dropping {}", self.store, message.type_name());
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!(
                    "Outbound queue of '{}' full, dropping {}",
                    self.store,
                    message.type_name()
                );
            }
            Err(TrySendError::Closed(message)) => {
                tracing::warn!(
                    "Outbound worker of '{}' stopped, dropping {}",
                    self.store,
                    message.type_name()
                );
            }
        }
    }

    /// Queue a message, waiting for queue space
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        let tx = lock(&self.outbound)
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Closed(self.store.clone()))?;
        tx.send(message)
            .await
            .map_err(|_| Error::Transport(format!("outbound worker of '{}' stopped", self.store)))
    }

    /// Stop accepting messages and wait up to `grace` for queued ones to be
    /// broadcast. Idempotent.
    pub async fn detach(&self, grace: Duration) {
        drop(lock(&self.outbound).take());
        let worker = lock(&self.worker).take();

        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                tracing::warn!("Outbound queue of '{}' not drained in time", self.store);
                worker.abort();
            }
            tracing::debug!("Replication detached for '{}'", self.store);
        }
    }
}

async fn outbound_worker(
    bus: Arc<dyn Bus>,
    topic: String,
    store: String,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let kind = message.type_name();
        let payload = match Envelope::new(store.clone(), message).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping {} for '{}': {}", kind, store, e);
                continue;
            }
        };

        if let Err(e) = bus.broadcast(&topic, payload).await {
            tracing::warn!("Broadcast of {} for '{}' failed: {}", kind, store, e);
        }
    }
}

/// Origins silent for this long are forgotten by duplicate suppression
const ORIGIN_IDLE: Duration = Duration::from_secs(600);

const PRUNE_EVERY: Duration = Duration::from_secs(60);

/// Last timestamp applied from one origin
#[derive(Debug, Clone, Copy)]
struct Seen {
    timestamp: u64,
    at: Instant,
}

/// Receiving half of a store's replication binding
pub struct Inbound {
    store: String,
    origin: Origin,
    last_seen: HashMap<Origin, Seen>,
    last_prune: Instant,
    subscription: Subscription,
}

impl Inbound {
    fn new(store: &str, origin: Origin, subscription: Subscription) -> Self {
        Self {
            store: store.to_string(),
            origin,
            last_seen: HashMap::new(),
            last_prune: Instant::now(),
            subscription,
        }
    }

    /// Next message addressed to this store from another instance.
    /// `None` once the bus subscription is closed.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            let payload = self.subscription.recv().await?;
            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Ignoring payload on '{}': {}", self.store, e);
                    continue;
                }
            };

            if envelope.store != self.store {
                continue;
            }

            if self.accept(&envelope.message) {
                return Some(envelope.message);
            }
        }
    }

    /// Drop our own echo and anything not newer than the last message seen
    /// from the same origin
    fn accept(&mut self, message: &Message) -> bool {
        let origin = message.origin();
        if *origin == self.origin && !matches!(message, Message::SyncResponse { .. }) {
            return false;
        }

        let Some(timestamp) = message.timestamp() else {
            return true;
        };

        let now = Instant::now();
        if now.duration_since(self.last_prune) >= PRUNE_EVERY {
            self.prune_idle(now);
        }

        match self.last_seen.get(origin) {
            Some(seen) if timestamp <= seen.timestamp => {
                tracing::debug!(
                    "Duplicate {} #{} from {} ignored",
                    message.type_name(),
                    timestamp,
                    origin
                );
                false
            }
            _ => {
                self.last_seen.insert(origin.clone(), Seen { timestamp, at: now });
                true
            }
        }
    }

    /// Forget origins not heard from within [`ORIGIN_IDLE`] of `now`
    fn prune_idle(&mut self, now: Instant) {
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.duration_since(seen.at) < ORIGIN_IDLE);
        let pruned = before - self.last_seen.len();
        if pruned > 0 {
            tracing::debug!("Forgot {} idle origins on '{}'", pruned, self.store);
        }
        self.last_prune = now;
    }
}
