//! Storage Instance
//!
//! The public handle onto one named, replicated key space. Reads and
//! writes are synchronous and local; broadcasts, snapshot I/O and GC run on
//! background tasks owned by the instance.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::options::StorageOptions;
use super::state::InstanceState;
use crate::error::{Error, Result};
use crate::path::{self, KeyPath};
use crate::persistence::PersistenceManager;
use crate::replication::{Inbound, Message, Origin, ReplicationChannel};
use crate::role::ManagerRole;
use crate::store::ttl::spawn_gc;
use crate::store::{lock, now_ms, Applied, EntryStore, ExpiryScheduler, Snapshot};
use crate::transport::Bus;

/// An outstanding sync request awaiting the manager
struct PendingSync {
    request_id: Uuid,
    done: oneshot::Sender<()>,
}

/// Shared state behind every clone of a [`Storage`] handle
struct Inner {
    name: String,
    options: StorageOptions,
    filename: PathBuf,
    state: Mutex<InstanceState>,
    store: Arc<Mutex<EntryStore>>,
    channel: ReplicationChannel,
    persistence: PersistenceManager,
    role: Arc<dyn ManagerRole>,
    expiry: ExpiryScheduler,
    pending_sync: Mutex<Option<PendingSync>>,
    sync_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    last_gc_error: Mutex<Option<String>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle onto a named replicated store. Clones share the same instance.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    /// Create the instance for `name`, register it on `bus` and start its
    /// background tasks. A non-manager instance with warm sync enabled
    /// also requests the manager's snapshot, without waiting for it.
    pub async fn connect(
        name: &str,
        options: StorageOptions,
        bus: Arc<dyn Bus>,
        role: Arc<dyn ManagerRole>,
    ) -> Result<Self> {
        options.validate(name)?;

        let filename = options.filename(name);
        let origin = Origin::new(options.node_id.clone());
        let (channel, inbound) =
            ReplicationChannel::attach(bus, name, origin, options.outbound_queue).await?;

        let token = CancellationToken::new();
        let store = Arc::new(Mutex::new(EntryStore::new()));
        let (expiry, expiry_task) = ExpiryScheduler::spawn(Arc::clone(&store), token.child_token());

        let inner = Arc::new(Inner {
            name: name.to_string(),
            filename: filename.clone(),
            state: Mutex::new(InstanceState::Connecting),
            store,
            channel,
            persistence: PersistenceManager::new(filename, Arc::clone(&role)),
            role,
            expiry,
            pending_sync: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(()),
            last_gc_error: Mutex::new(None),
            token,
            tasks: Mutex::new(vec![expiry_task]),
            options,
        });

        let inbound_task = tokio::spawn(inbound_loop(Arc::downgrade(&inner), inbound, inner.token.clone()));
        let gc_task = {
            let weak = Arc::downgrade(&inner);
            spawn_gc(inner.options.gc_interval, inner.token.clone(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.gc_tick().await;
                    }
                }
            })
        };
        lock(&inner.tasks).extend([inbound_task, gc_task]);

        *lock(&inner.state) = InstanceState::Connected;
        let storage = Self { inner };

        tracing::info!(
            "Storage '{}' connected as {} (snapshot {})",
            storage.name(),
            storage.origin(),
            storage.filename().display()
        );

        if storage.inner.options.warm_sync && !storage.inner.role.is_manager() {
            let warm = storage.clone();
            tokio::spawn(async move {
                match warm.sync().await {
                    Ok(()) => tracing::debug!("Warm sync of '{}' complete", warm.name()),
                    Err(e) => tracing::debug!("Warm sync of '{}' skipped: {}", warm.name(), e),
                }
            });
        }

        Ok(storage)
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot file path
    pub fn filename(&self) -> &Path {
        &self.inner.filename
    }

    /// Origin stamped on this instance's broadcasts
    pub fn origin(&self) -> &Origin {
        self.inner.channel.origin()
    }

    /// Current lifecycle state
    pub fn state(&self) -> InstanceState {
        *lock(&self.inner.state)
    }

    /// Whether the instance is connected
    pub fn connected(&self) -> bool {
        self.state() == InstanceState::Connected
    }

    /// Whether the instance has been closed or destroyed
    pub fn closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether a sync request is awaiting the manager
    pub fn syncing(&self) -> bool {
        lock(&self.inner.pending_sync).is_some()
    }

    /// Whether this process currently holds the manager role
    pub fn is_manager(&self) -> bool {
        self.inner.role.is_manager()
    }

    /// Last GC flush failure, cleared by the next successful tick
    pub fn last_gc_error(&self) -> Option<String> {
        lock(&self.inner.last_gc_error).clone()
    }

    /// Write `value` at `path`, optionally expiring it after `ttl`.
    ///
    /// A nested path such as `bar.name` rewrites the whole `bar` entry with
    /// the field replaced; a ttl on a nested path expires only that field.
    /// Returns the written value. Values that cannot be represented as JSON
    /// are rejected before anything changes.
    pub fn set<T>(&self, path: &str, value: &T, ttl: Option<Duration>) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let key_path = KeyPath::parse(path)?;
        let value = serde_json::to_value(value)?;

        // Timestamp and queue under the state lock so concurrent writers
        // enqueue in timestamp order
        let _state = self.open_state()?;
        let now = now_ms();
        let mut store = lock(&self.inner.store);

        let (whole, deadline) = if key_path.is_whole() {
            let deadline = store.set(key_path.key(), value.clone(), ttl, now);
            (value.clone(), deadline)
        } else {
            let current = store.get(key_path.key(), now).cloned().unwrap_or(Value::Null);
            let whole = path::write(current, key_path.field_segments(), value.clone())?;
            let deadline =
                store.set_field(key_path.key(), whole.clone(), key_path.field_segments(), ttl, now);
            (whole, deadline)
        };

        if let Some(deadline) = deadline {
            self.inner.expiry.schedule(key_path.key(), deadline);
        }

        self.inner.channel.publish(Message::Set {
            key: key_path.key().to_string(),
            value: whole,
            field: key_path.field(),
            ttl_ms: ttl.map(|ttl| ttl.as_millis().min(u64::MAX as u128) as u64),
            origin: self.origin().clone(),
            timestamp: self.inner.channel.next_timestamp(),
        });
        Ok(value)
    }

    /// Read the live value at `path`
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let key_path = KeyPath::parse(path)?;
        let _state = self.open_state()?;
        let mut store = lock(&self.inner.store);
        let Some(value) = store.get(key_path.key(), now_ms()) else {
            return Ok(None);
        };
        Ok(path::read(value, key_path.field_segments()).cloned())
    }

    /// Read the live value at `path` into `T`
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.get(path)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    /// Whether `path` holds a live value
    pub fn has(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Remove the value at `path`. Removing an absent path is a no-op.
    pub fn delete(&self, path: &str) -> Result<()> {
        let key_path = KeyPath::parse(path)?;

        let _state = self.open_state()?;
        let now = now_ms();
        let mut store = lock(&self.inner.store);

        let message = if key_path.is_whole() {
            store.delete(key_path.key());
            Message::Delete {
                key: key_path.key().to_string(),
                origin: self.origin().clone(),
                timestamp: self.inner.channel.next_timestamp(),
            }
        } else {
            let Some(mut whole) = store.get(key_path.key(), now).cloned() else {
                return Ok(());
            };
            if !path::remove(&mut whole, key_path.field_segments()) {
                return Ok(());
            }
            store.set_field(key_path.key(), whole.clone(), key_path.field_segments(), None, now);
            Message::Set {
                key: key_path.key().to_string(),
                value: whole,
                field: key_path.field(),
                ttl_ms: None,
                origin: self.origin().clone(),
                timestamp: self.inner.channel.next_timestamp(),
            }
        };

        self.inner.channel.publish(message);
        Ok(())
    }

    /// Live top-level keys, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let _state = self.open_state()?;
        Ok(lock(&self.inner.store).keys(now_ms()))
    }

    /// Number of live top-level keys
    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    /// Whether no live key exists
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush the live content if this process is the manager. Returns
    /// whether a write happened.
    pub async fn flush(&self) -> Result<bool> {
        self.ensure_open()?;
        let snapshot = self.inner.live_snapshot();
        self.inner.persistence.flush(&snapshot).await
    }

    /// Replace the local content with the canonical copy.
    ///
    /// The manager flushes and reloads its own snapshot. Any other instance
    /// asks the manager over the bus and fails with [`Error::SyncTimeout`]
    /// when no answer arrives in time.
    pub async fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let _sync = self.inner.sync_lock.lock().await;
        self.ensure_open()?;

        if self.inner.role.is_manager() {
            let live = self.inner.live_snapshot();
            self.inner.persistence.flush(&live).await?;
            let snapshot = self.inner.persistence.load().await?;
            tracing::info!("Manager sync of '{}' loaded {} entries", self.name(), snapshot.len());
            self.inner.install(snapshot);
            return Ok(());
        }

        let request_id = Uuid::new_v4();
        let (done, response) = oneshot::channel();
        *lock(&self.inner.pending_sync) = Some(PendingSync { request_id, done });

        let request = Message::SyncRequest {
            origin: self.origin().clone(),
            request_id,
        };
        if let Err(e) = self.inner.channel.enqueue(request).await {
            self.inner.clear_pending(request_id);
            return Err(e);
        }

        let timeout = self.inner.options.sync_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed(self.name().to_string())),
            Err(_) => {
                self.inner.clear_pending(request_id);
                Err(Error::SyncTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Flush if manager, then detach from replication. Further reads and
    /// writes fail with [`Error::Closed`]. Calling it again is a no-op.
    ///
    /// The instance ends up closed even when the flush fails; the flush
    /// error is returned after detaching.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return Ok(());
            }
            *state = InstanceState::Closed;
        }

        let snapshot = self.inner.live_snapshot();
        let flushed = self.inner.persistence.flush(&snapshot).await;
        self.inner.detach().await;

        match flushed {
            Ok(_) => {
                tracing::info!("Storage '{}' closed", self.name());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Storage '{}' closed without final flush: {}", self.name(), e);
                Err(e)
            }
        }
    }

    /// Clear local data, remove the snapshot file (when manager) and detach.
    /// Works from the connected or closed state; calling it again is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let mut state = lock(&self.inner.state);
            if *state == InstanceState::Destroyed {
                return Ok(());
            }
            *state = InstanceState::Destroyed;
        }

        lock(&self.inner.store).clear();
        let removed = self.inner.persistence.destroy_file().await;
        self.inner.detach().await;

        match removed {
            Ok(_) => {
                tracing::info!("Storage '{}' destroyed", self.name());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Storage '{}' destroyed, snapshot removal failed: {}", self.name(), e);
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        self.open_state().map(|_| ())
    }

    /// Lock the state for the duration of an operation, failing if closed
    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, InstanceState>> {
        let state = lock(&self.inner.state);
        if state.is_open() {
            Ok(state)
        } else {
            Err(Error::Closed(self.inner.name.clone()))
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.inner.name)
            .field("origin", self.origin())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn live_snapshot(&self) -> Snapshot {
        lock(&self.store).snapshot(now_ms())
    }

    /// Replace the local content and re-arm expiry timers
    fn install(&self, snapshot: Snapshot) {
        let mut store = lock(&self.store);
        store.replace(snapshot);
        for (key, deadline) in store.deadlines() {
            self.expiry.schedule(&key, deadline);
        }
    }

    fn clear_pending(&self, request_id: Uuid) {
        let mut pending = lock(&self.pending_sync);
        if pending.as_ref().map(|p| p.request_id) == Some(request_id) {
            *pending = None;
        }
    }

    async fn handle(&self, message: Message) {
        match message {
            Message::Set { .. } | Message::Delete { .. } => self.apply(&message),
            Message::SyncRequest { origin, request_id } => {
                self.answer_sync(origin, request_id).await;
            }
            Message::SyncResponse {
                requester,
                request_id,
                snapshot,
            } => {
                if requester != *self.channel.origin() {
                    return;
                }
                let pending = {
                    let mut slot = lock(&self.pending_sync);
                    if slot.as_ref().is_some_and(|p| p.request_id == request_id) {
                        slot.take()
                    } else {
                        None
                    }
                };
                let Some(pending) = pending else {
                    tracing::debug!("Stale sync response for '{}' ignored", self.name);
                    return;
                };

                tracing::info!("Synced '{}' from manager: {} entries", self.name, snapshot.len());
                self.install(snapshot);
                let _ = pending.done.send(());
            }
        }
    }

    fn apply(&self, message: &Message) {
        if !lock(&self.state).is_open() {
            return;
        }
        let applied = lock(&self.store).apply_remote(message, now_ms());
        if let Applied::Changed {
            key,
            deadline: Some(deadline),
        } = applied
        {
            self.expiry.schedule(&key, deadline);
        }
    }

    async fn answer_sync(&self, requester: Origin, request_id: Uuid) {
        if !self.role.is_manager() {
            return;
        }

        let live = self.live_snapshot();
        let snapshot = match self.persistence.flush(&live).await {
            Ok(true) => match self.persistence.load().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Answering sync of '{}' from memory: {}", self.name, e);
                    live
                }
            },
            Ok(false) => {
                tracing::debug!("Lost manager role while answering sync of '{}'", self.name);
                return;
            }
            Err(e) => {
                tracing::warn!("Answering sync of '{}' from memory: {}", self.name, e);
                live
            }
        };

        tracing::debug!("Answering sync of '{}' for {}", self.name, requester);
        let response = Message::SyncResponse {
            requester,
            request_id,
            snapshot,
        };
        if let Err(e) = self.channel.enqueue(response).await {
            tracing::warn!("Could not queue sync response for '{}': {}", self.name, e);
        }
    }

    async fn gc_tick(&self) {
        let now = now_ms();
        let (removed, snapshot) = {
            let mut store = lock(&self.store);
            let removed = store.sweep(now);
            (removed, store.snapshot(now))
        };
        if removed > 0 {
            tracing::debug!("GC removed {} expired items from '{}'", removed, self.name);
        }

        if !self.role.is_manager() {
            return;
        }

        match self.persistence.purge_expired(snapshot, now).await {
            Ok(_) => *lock(&self.last_gc_error) = None,
            Err(e) => {
                tracing::warn!("GC flush of '{}' failed, retrying next tick: {}", self.name, e);
                *lock(&self.last_gc_error) = Some(e.to_string());
            }
        }
    }

    /// Stop background work and leave the bus
    async fn detach(&self) {
        self.token.cancel();
        drop(lock(&self.pending_sync).take());
        self.channel.detach(self.options.sync_timeout).await;
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn inbound_loop(inner: Weak<Inner>, mut inbound: Inbound, token: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = inbound.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        tracing::trace!("'{}' received {}", inner.name, message.type_name());
        inner.handle(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::SharedRole;
    use crate::transport::LocalBus;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(dir: &Path, node: &str) -> StorageOptions {
        StorageOptions::new(dir)
            .node_id(node)
            .gc_interval(Duration::from_secs(60))
            .sync_timeout(Duration::from_millis(300))
            .warm_sync(false)
    }

    async fn open(bus: &LocalBus, dir: &Path, node: &str, role: &SharedRole) -> Storage {
        Storage::connect("cache", options(dir, node), Arc::new(bus.clone()), Arc::new(role.clone()))
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_read_your_write_and_propagation() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;

        assert!(a.connected());
        assert_eq!(a.set("foo", "hi", None).unwrap(), json!("hi"));
        assert_eq!(a.get("foo").unwrap(), Some(json!("hi")));

        eventually(|| b.get("foo").unwrap() == Some(json!("hi"))).await;
        assert_eq!(b.get_as::<String>("foo").unwrap().as_deref(), Some("hi"));
        assert_eq!(b.keys().unwrap(), vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn test_nested_ttl_expires_only_the_field() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;

        a.set("bar", &json!({"name": "old", "age": 3}), None).unwrap();
        a.set("bar.name", "X", Some(Duration::from_millis(300))).unwrap();

        eventually(|| b.get("bar.name").unwrap() == Some(json!("X"))).await;
        assert!(b.has("bar.age").unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!b.has("bar.name").unwrap());
        assert!(!a.has("bar.name").unwrap());
        assert_eq!(b.get("bar").unwrap(), Some(json!({"age": 3})));
    }

    #[tokio::test]
    async fn test_whole_value_ttl() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;

        a.set("k", &1, Some(Duration::from_millis(100))).unwrap();
        assert!(a.has("k").unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!a.has("k").unwrap());
        assert_eq!(a.get("k").unwrap(), None);
        assert!(a.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_delete_propagates() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;

        a.set("k", &1, None).unwrap();
        a.set("obj", &json!({"a": 1, "b": 2}), None).unwrap();
        eventually(|| b.has("obj").unwrap() && b.has("k").unwrap()).await;

        a.delete("k").unwrap();
        a.delete("obj.a").unwrap();
        a.delete("missing").unwrap();
        assert_eq!(a.get("k").unwrap(), None);

        eventually(|| !b.has("k").unwrap()).await;
        eventually(|| b.get("obj").unwrap() == Some(json!({"b": 2}))).await;
    }

    #[tokio::test]
    async fn test_unserializable_value_leaves_store_unchanged() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;

        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1);
        assert!(matches!(a.set("k", &bad, None), Err(Error::Serialization(_))));
        assert!(!a.has("k").unwrap());
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_operations() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(false)).await;

        a.close().await.unwrap();
        assert!(a.closed());
        assert_eq!(a.state(), InstanceState::Closed);
        assert!(matches!(a.set("k", &1, None), Err(Error::Closed(_))));
        assert!(a.get("k").unwrap_err().is_closed());
        assert!(a.has("k").unwrap_err().is_closed());
        assert!(a.delete("k").unwrap_err().is_closed());
        assert!(a.sync().await.unwrap_err().is_closed());

        a.close().await.unwrap();
        a.destroy().await.unwrap();
        assert_eq!(a.state(), InstanceState::Destroyed);
        a.destroy().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.state(), InstanceState::Destroyed);
    }

    #[tokio::test]
    async fn test_close_flushes_and_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let role = SharedRole::new(true);
        let a = open(&bus, dir.path(), "a", &role).await;

        a.set("foo", "hi", None).unwrap();
        a.close().await.unwrap();
        assert!(a.filename().exists());

        let snapshot = PersistenceManager::new(a.filename().to_path_buf(), Arc::new(role.clone()))
            .load()
            .await
            .unwrap();
        assert_eq!(snapshot.entries["foo"].value, json!("hi"));

        let c = open(&bus, dir.path(), "c", &role).await;
        c.destroy().await.unwrap();
        assert!(!c.filename().exists());

        let reloaded = PersistenceManager::new(c.filename().to_path_buf(), Arc::new(role))
            .load()
            .await
            .unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_sync_from_manager_replaces_local_state() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;
        a.set("foo", "hi", None).unwrap();

        bus.set_partitioned(true);
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;
        b.set("local", &1, None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.set_partitioned(false);

        b.sync().await.unwrap();
        assert!(!b.syncing());
        assert_eq!(b.keys().unwrap(), vec!["foo".to_string()]);
        assert!(a.filename().exists());
    }

    #[tokio::test]
    async fn test_sync_before_any_flush_empties_store() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let _a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;

        bus.set_partitioned(true);
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;
        b.set("only-here", &1, None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.set_partitioned(false);

        b.sync().await.unwrap();
        assert!(b.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_sync_without_manager_times_out() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;
        b.set("k", &1, None).unwrap();

        let err = b.sync().await.unwrap_err();
        assert!(matches!(err, Error::SyncTimeout(300)));
        assert!(err.is_retryable());
        assert!(!b.syncing());
        assert!(b.has("k").unwrap());
    }

    #[tokio::test]
    async fn test_manager_sync_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;

        a.set("bar", &json!({"name": "X"}), None).unwrap();
        a.sync().await.unwrap();
        assert_eq!(a.get("bar.name").unwrap(), Some(json!("X")));
        assert!(a.filename().exists());
        assert!(a.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_role_transfer_during_gc_keeps_file_valid() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let role_a = SharedRole::new(true);
        let role_c = SharedRole::new(false);
        let fast = |node: &str| options(dir.path(), node).gc_interval(Duration::from_millis(20));

        let a = Storage::connect("cache", fast("a"), Arc::new(bus.clone()), Arc::new(role_a.clone()))
            .await
            .unwrap();
        let c = Storage::connect("cache", fast("c"), Arc::new(bus.clone()), Arc::new(role_c.clone()))
            .await
            .unwrap();

        for i in 0..20 {
            a.set(&format!("k{}", i), &i, None).unwrap();
        }
        a.set("gone", &0, Some(Duration::from_millis(10))).unwrap();
        eventually(|| c.len().unwrap() == 20).await;

        for _ in 0..10 {
            role_a.set(false);
            role_c.set(true);
            tokio::time::sleep(Duration::from_millis(15)).await;
            role_c.set(false);
            role_a.set(true);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let snapshot = PersistenceManager::new(a.filename().to_path_buf(), Arc::new(role_a.clone()))
            .load()
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 20);
        assert!(!snapshot.entries.contains_key("gone"));
        assert!(a.last_gc_error().is_none());
        assert!(c.last_gc_error().is_none());
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let result = Storage::connect(
            "../escape",
            options(dir.path(), "a"),
            Arc::new(bus),
            Arc::new(SharedRole::new(true)),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_all_reach_peer() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let mut opts = options(dir.path(), "a");
        opts.outbound_queue = 100_000;
        let a = Storage::connect("cache", opts, Arc::new(bus.clone()), Arc::new(SharedRole::new(true)))
            .await
            .unwrap();
        let b = open(&bus, dir.path(), "b", &SharedRole::new(false)).await;

        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let a = a.clone();
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        a.set(&format!("k{}_{}", t, i), &i, None).unwrap();
                    }
                });
            }
        });
        assert_eq!(a.len().unwrap(), THREADS * PER_THREAD);

        for _ in 0..500 {
            if b.len().unwrap() == THREADS * PER_THREAD {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(b.len().unwrap(), THREADS * PER_THREAD);
    }

    #[tokio::test]
    async fn test_far_array_index_is_rejected() {
        let dir = tempdir().unwrap();
        let bus = LocalBus::new();
        let a = open(&bus, dir.path(), "a", &SharedRole::new(true)).await;

        a.set("list", &json!([1]), None).unwrap();
        let err = a.set(&format!("list[{}]", usize::MAX), &2, None).unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
        assert_eq!(a.get("list").unwrap(), Some(json!([1])));

        a.set("list[2]", &3, None).unwrap();
        assert_eq!(a.get("list").unwrap(), Some(json!([1, null, 3])));
    }

    #[tokio::test]
    async fn test_gc_flush_failure_is_recorded_and_cleared() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let bus = LocalBus::new();
        let opts = options(&blocker.join("data"), "a").gc_interval(Duration::from_millis(30));
        let a = Storage::connect("cache", opts, Arc::new(bus), Arc::new(SharedRole::new(true)))
            .await
            .unwrap();
        a.set("k", &1, None).unwrap();

        eventually(|| a.last_gc_error().is_some()).await;
        assert!(a.connected());
        a.set("j", &2, None).unwrap();
        assert_eq!(a.get("k").unwrap(), Some(json!(1)));

        std::fs::remove_file(&blocker).unwrap();
        eventually(|| a.last_gc_error().is_none()).await;
        assert!(a.filename().exists());
    }

    #[tokio::test]
    async fn test_close_and_destroy_report_persistence_errors_after_detaching() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let data = blocker.join("data");
        let bus = LocalBus::new();
        let role = SharedRole::new(true);

        let a = open(&bus, &data, "a", &role).await;
        a.set("k", &1, None).unwrap();
        let err = a.close().await.unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(a.closed());
        assert!(a.get("k").unwrap_err().is_closed());
        a.close().await.unwrap();

        let c = open(&bus, &data, "c", &role).await;
        let err = c.destroy().await.unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert_eq!(c.state(), InstanceState::Destroyed);
        assert!(c.set("k", &1, None).unwrap_err().is_closed());
        c.destroy().await.unwrap();
    }
}
