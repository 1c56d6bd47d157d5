//! TTL and GC Scheduling
//!
//! Two independent mechanisms remove expired data: a deadline queue that
//! fires once per scheduled expiry, and a periodic GC tick that sweeps
//! everything. Both end in the idempotent [`EntryStore::expire`] /
//! [`EntryStore::sweep`] calls, so overlapping with lazy expiry on read
//! is harmless.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::cache::EntryStore;
use super::entry::{now_ms, Timestamp};
use super::lock;

/// Min-heap of pending (deadline, key) pairs
#[derive(Debug, Default)]
pub struct ExpiryQueue {
    heap: BinaryHeap<Reverse<(Timestamp, String)>>,
}

impl ExpiryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a check of `key` at `deadline`
    pub fn push(&mut self, key: String, deadline: Timestamp) {
        self.heap.push(Reverse((deadline, key)));
    }

    /// Earliest scheduled deadline
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop every key whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                due.push(key);
            }
        }
        due
    }

    /// Number of scheduled checks
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Handle used to schedule per-key expiry checks on the background task
#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    tx: mpsc::UnboundedSender<(String, Timestamp)>,
}

impl ExpiryScheduler {
    /// Spawn the expiry task over `store`. The task stops when `token` is
    /// cancelled or every scheduler handle is dropped.
    pub fn spawn(
        store: Arc<Mutex<EntryStore>>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(expiry_loop(store, rx, token));
        (Self { tx }, handle)
    }

    /// Schedule an expiry check for `key` at `deadline`
    pub fn schedule(&self, key: &str, deadline: Timestamp) {
        if self.tx.send((key.to_string(), deadline)).is_err() {
            tracing::debug!("Expiry task stopped; '{}' will expire lazily", key);
        }
    }
}

async fn expiry_loop(
    store: Arc<Mutex<EntryStore>>,
    mut rx: mpsc::UnboundedReceiver<(String, Timestamp)>,
    token: CancellationToken,
) {
    let mut queue = ExpiryQueue::new();

    loop {
        let wait = queue
            .next_deadline()
            .map(|deadline| Duration::from_millis((deadline - now_ms()).max(0) as u64));

        tokio::select! {
            _ = token.cancelled() => break,
            scheduled = rx.recv() => match scheduled {
                Some((key, deadline)) => queue.push(key, deadline),
                None => break,
            },
            _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                let now = now_ms();
                let due = queue.pop_due(now);
                if due.is_empty() {
                    continue;
                }
                let mut store = lock(&store);
                for key in due {
                    if store.expire(&key, now) {
                        tracing::debug!("Expired '{}'", key);
                    }
                }
            }
        }
    }
}

/// Spawn a periodic GC ticker calling `tick` every `period`. The first
/// tick fires one full period after spawning.
pub fn spawn_gc<F, Fut>(period: Duration, token: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}
