//! Entry Store
//!
//! The per-instance key space. All mutation goes through `set`,
//! `set_field`, `delete` and `apply_remote`; reads remove expired data
//! as a side effect. Every operation takes the current time explicitly so
//! the store itself never touches a clock.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use super::entry::{deadline_after, purge_entries, Entry, Snapshot, Timestamp};
use crate::path::{self, Segment};
use crate::replication::Message;

/// Outcome of applying a peer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Message carried no mutation for the store
    Ignored,
    /// A key changed; `deadline` is the new expiry to schedule, if any
    Changed {
        key: String,
        deadline: Option<Timestamp>,
    },
}

/// In-memory mapping from key to entry
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: BTreeMap<String, Entry>,
}

impl EntryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a whole value, replacing any existing entry and its deadlines.
    /// Returns the deadline to schedule.
    pub fn set(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let deadline = ttl.map(|ttl| deadline_after(ttl, now));
        self.entries.insert(key.to_string(), Entry::new(value, deadline));
        deadline
    }

    /// Store a whole value produced by a nested write at `field`. The entry
    /// deadline and unrelated field deadlines are kept; deadlines at or
    /// beneath `field` are replaced by the new ttl, if any.
    pub fn set_field(
        &mut self,
        key: &str,
        value: Value,
        field: &[Segment],
        ttl: Option<Duration>,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Null, None));

        if entry.is_expired(now) {
            *entry = Entry::new(Value::Null, None);
        }

        entry.value = value;
        entry.field_expiry.retain(|existing, _| {
            path::parse_segments(existing)
                .map(|segments| !path::is_within(&segments, field))
                .unwrap_or(false)
        });

        let deadline = ttl.map(|ttl| deadline_after(ttl, now));
        if let Some(deadline) = deadline {
            entry.field_expiry.insert(path::render(field), deadline);
        }
        deadline
    }

    /// Get the live value at `key`, dropping it (or its expired fields) first
    /// if a deadline has passed
    pub fn get(&mut self, key: &str, now: Timestamp) -> Option<&Value> {
        self.expire(key, now);
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Whether `key` holds a live entry
    pub fn has(&mut self, key: &str, now: Timestamp) -> bool {
        self.get(key, now).is_some()
    }

    /// Remove `key`. Absent keys are not an error.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Apply a mutation received from a peer. Never triggers a broadcast.
    pub fn apply_remote(&mut self, message: &Message, now: Timestamp) -> Applied {
        match message {
            Message::Set {
                key,
                value,
                field,
                ttl_ms,
                ..
            } => {
                let ttl = ttl_ms.map(Duration::from_millis);
                let segments = field.as_deref().map(path::parse_segments);
                let deadline = match segments {
                    Some(Ok(segments)) if !segments.is_empty() => {
                        self.set_field(key, value.clone(), &segments, ttl, now)
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Ignoring malformed field in remote set of '{}': {}", key, e);
                        self.set(key, value.clone(), None, now)
                    }
                    _ => self.set(key, value.clone(), ttl, now),
                };
                Applied::Changed {
                    key: key.clone(),
                    deadline,
                }
            }
            Message::Delete { key, .. } => {
                self.delete(key);
                Applied::Changed {
                    key: key.clone(),
                    deadline: None,
                }
            }
            Message::SyncRequest { .. } | Message::SyncResponse { .. } => Applied::Ignored,
        }
    }

    /// Replace the whole content with a snapshot
    pub fn replace(&mut self, snapshot: Snapshot) {
        self.entries = snapshot.entries;
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Expiry check for a single key. Idempotent: does nothing when the key
    /// is gone or nothing is due. Returns whether anything was removed.
    pub fn expire(&mut self, key: &str, now: Timestamp) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        if entry.is_expired(now) {
            self.entries.remove(key);
            return true;
        }

        entry.prune_fields(now) > 0
    }

    /// Remove every expired entry and field. Returns how many were removed.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        purge_entries(&mut self.entries, now)
    }

    /// Live top-level keys, sorted
    pub fn keys(&self, now: Timestamp) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of stored entries, including ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the live content
    pub fn snapshot(&self, now: Timestamp) -> Snapshot {
        let mut snapshot = Snapshot::empty(now);
        snapshot.entries = self.entries.clone();
        snapshot.purge_expired(now);
        snapshot
    }

    /// Pending deadlines, used to re-arm timers after a replace
    pub fn deadlines(&self) -> Vec<(String, Timestamp)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.next_deadline().map(|d| (key.clone(), d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Origin;
    use serde_json::json;

    fn segments(p: &str) -> Vec<Segment> {
        path::parse_segments(p).unwrap()
    }

    #[test]
    fn test_read_your_write() {
        let mut store = EntryStore::new();
        store.set("foo", json!("hi"), None, 0);
        assert_eq!(store.get("foo", 0), Some(&json!("hi")));
        assert!(store.has("foo", 0));

        store.set("foo", json!("again"), None, 1);
        assert_eq!(store.get("foo", 1), Some(&json!("again")));
    }

    #[test]
    fn test_lazy_expiry_on_read() {
        let mut store = EntryStore::new();
        let deadline = store.set("k", json!(1), Some(Duration::from_millis(100)), 1_000);
        assert_eq!(deadline, Some(1_100));

        assert!(store.has("k", 1_099));
        assert!(!store.has("k", 1_100));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_delete_is_noop_when_absent() {
        let mut store = EntryStore::new();
        assert!(!store.delete("missing"));
        store.set("k", json!(1), None, 0);
        assert!(store.delete("k"));
        assert_eq!(store.get("k", 0), None);
    }

    #[test]
    fn test_field_ttl_keeps_siblings() {
        let mut store = EntryStore::new();
        store.set("bar", json!({"id": 1}), None, 0);
        store.set_field(
            "bar",
            json!({"id": 1, "name": "X"}),
            &segments("name"),
            Some(Duration::from_millis(50)),
            0,
        );

        assert_eq!(store.get("bar", 49), Some(&json!({"id": 1, "name": "X"})));
        assert_eq!(store.get("bar", 50), Some(&json!({"id": 1})));
    }

    #[test]
    fn test_nested_overwrite_clears_field_deadline() {
        let mut store = EntryStore::new();
        store.set_field("bar", json!({"a": {"b": 1}}), &segments("a.b"), Some(Duration::from_millis(10)), 0);
        store.set_field("bar", json!({"a": {"b": 2}}), &segments("a"), None, 5);
        assert_eq!(store.get("bar", 100), Some(&json!({"a": {"b": 2}})));
    }

    #[test]
    fn test_apply_remote_duplicate_is_idempotent() {
        let mut store = EntryStore::new();
        let msg = Message::Set {
            key: "foo".into(),
            value: json!("hi"),
            field: None,
            ttl_ms: None,
            origin: Origin::new("peer"),
            timestamp: 1,
        };

        store.apply_remote(&msg, 10);
        let once = store.snapshot(10);
        store.apply_remote(&msg, 10);
        assert_eq!(store.snapshot(10), once);
    }

    #[test]
    fn test_apply_remote_ttl_and_delete() {
        let mut store = EntryStore::new();
        let origin = Origin::new("peer");
        let applied = store.apply_remote(
            &Message::Set {
                key: "k".into(),
                value: json!(1),
                field: None,
                ttl_ms: Some(20),
                origin: origin.clone(),
                timestamp: 1,
            },
            100,
        );
        assert_eq!(
            applied,
            Applied::Changed {
                key: "k".into(),
                deadline: Some(120)
            }
        );

        store.apply_remote(
            &Message::Delete {
                key: "k".into(),
                origin: origin.clone(),
                timestamp: 2,
            },
            101,
        );
        assert!(!store.has("k", 101));

        let ignored = store.apply_remote(
            &Message::SyncRequest {
                origin,
                request_id: uuid::Uuid::new_v4(),
            },
            101,
        );
        assert_eq!(ignored, Applied::Ignored);
    }

    #[test]
    fn test_sweep_and_snapshot() {
        let mut store = EntryStore::new();
        store.set("a", json!(1), Some(Duration::from_millis(10)), 0);
        store.set("b", json!(2), None, 0);
        store.set_field("c", json!({"x": 1, "y": 2}), &segments("x"), Some(Duration::from_millis(10)), 0);

        assert_eq!(store.snapshot(5).len(), 3);
        assert_eq!(store.keys(20), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(store.sweep(20), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("c", 20), Some(&json!({"y": 2})));
        assert_eq!(store.sweep(20), 0);
    }

    #[test]
    fn test_replace_discards_local_state() {
        let mut store = EntryStore::new();
        store.set("local", json!(1), None, 0);

        let mut snapshot = Snapshot::empty(0);
        snapshot.entries.insert("remote".into(), Entry::new(json!(2), Some(50)));
        store.replace(snapshot);

        assert!(!store.has("local", 0));
        assert!(store.has("remote", 0));
        assert_eq!(store.deadlines(), vec![("remote".to_string(), 50)]);
    }
}
