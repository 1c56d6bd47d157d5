//! Entries and Snapshots
//!
//! An entry is a JSON value plus optional deadlines. Deadlines are absolute
//! wall-clock milliseconds so they survive a trip through the persisted
//! snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Snapshot format version written to disk
pub const SNAPSHOT_VERSION: u32 = 1;

/// Current wall-clock time in milliseconds
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Absolute deadline `ttl` after `now`
pub fn deadline_after(ttl: Duration, now: Timestamp) -> Timestamp {
    now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

/// The one expiry predicate shared by lazy reads, timers and GC sweeps
pub fn is_expired(deadline: Option<Timestamp>, now: Timestamp) -> bool {
    matches!(deadline, Some(d) if d <= now)
}

/// A stored value with its deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The stored document
    pub value: Value,

    /// Deadline of the whole entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,

    /// Deadlines of nested fields, keyed by canonical sub-path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_expiry: BTreeMap<String, Timestamp>,
}

impl Entry {
    /// Create an entry without field deadlines
    pub fn new(value: Value, expires_at: Option<Timestamp>) -> Self {
        Self {
            value,
            expires_at,
            field_expiry: BTreeMap::new(),
        }
    }

    /// Whether the whole entry is past its deadline
    pub fn is_expired(&self, now: Timestamp) -> bool {
        is_expired(self.expires_at, now)
    }

    /// Remove expired fields from the value. Returns how many were dropped.
    pub fn prune_fields(&mut self, now: Timestamp) -> usize {
        let expired: Vec<String> = self
            .field_expiry
            .iter()
            .filter(|(_, deadline)| is_expired(Some(**deadline), now))
            .map(|(field, _)| field.clone())
            .collect();

        for field in &expired {
            self.field_expiry.remove(field);
            if let Ok(segments) = path::parse_segments(field) {
                path::remove(&mut self.value, &segments);
            }
        }

        expired.len()
    }

    /// Earliest pending deadline of the entry or any of its fields
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.field_expiry
            .values()
            .copied()
            .chain(self.expires_at)
            .min()
    }
}

/// Whole-store serialization, the unit of persistence and of sync responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// When the snapshot was taken
    #[serde(default)]
    pub taken_at: Timestamp,

    /// Entries keyed by top-level key
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: 0,
            entries: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Empty snapshot taken at `now`
    pub fn empty(now: Timestamp) -> Self {
        Self {
            taken_at: now,
            ..Self::default()
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries and expired fields. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        purge_entries(&mut self.entries, now)
    }
}

/// Drop expired entries from `entries` and prune expired fields of the
/// rest. Returns how many entries and fields were removed.
pub(crate) fn purge_entries(entries: &mut BTreeMap<String, Entry>, now: Timestamp) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    let mut removed = before - entries.len();
    for entry in entries.values_mut() {
        removed += entry.prune_fields(now);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_expired_predicate() {
        assert!(!is_expired(None, 1_000));
        assert!(!is_expired(Some(1_001), 1_000));
        assert!(is_expired(Some(1_000), 1_000));
        assert!(is_expired(Some(999), 1_000));
    }

    #[test]
    fn test_prune_fields_keeps_siblings() {
        let mut entry = Entry::new(json!({"name": "X", "id": 7}), None);
        entry.field_expiry.insert("name".into(), 500);

        assert_eq!(entry.prune_fields(400), 0);
        assert_eq!(entry.prune_fields(500), 1);
        assert_eq!(entry.value, json!({"id": 7}));
        assert!(entry.field_expiry.is_empty());
        assert!(!entry.is_expired(500));
    }

    #[test]
    fn test_next_deadline() {
        let mut entry = Entry::new(json!({}), Some(900));
        assert_eq!(entry.next_deadline(), Some(900));
        entry.field_expiry.insert("a".into(), 300);
        assert_eq!(entry.next_deadline(), Some(300));
        assert_eq!(Entry::new(json!(1), None).next_deadline(), None);
    }

    #[test]
    fn test_snapshot_purge() {
        let mut snapshot = Snapshot::empty(0);
        snapshot.entries.insert("live".into(), Entry::new(json!(1), None));
        snapshot.entries.insert("dead".into(), Entry::new(json!(2), Some(10)));
        let mut partial = Entry::new(json!({"a": 1, "b": 2}), None);
        partial.field_expiry.insert("a".into(), 10);
        snapshot.entries.insert("partial".into(), partial);

        assert_eq!(snapshot.purge_expired(20), 2);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries["partial"].value, json!({"b": 2}));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = Snapshot::empty(5);
        snapshot.entries.insert("foo".into(), Entry::new(json!("hi"), None));
        let text = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            text,
            r#"{"version":1,"taken_at":5,"entries":{"foo":{"value":"hi"}}}"#
        );
    }
}
