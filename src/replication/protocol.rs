//! Replication Protocol
//!
//! Defines the messages exchanged between instances of the same named
//! store. Messages are JSON encoded because entry values are arbitrary
//! JSON documents.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Snapshot;

/// Identifies the sending process/instance pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    /// Node (process) identifier from configuration
    pub node: String,
    /// Per-instance identifier
    pub instance: Uuid,
}

impl Origin {
    /// Fresh origin for a new instance on `node`
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            instance: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.instance)
    }
}

/// Protocol messages for instance communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A key was written. `value` is always the whole entry value; `field`
    /// names the nested sub-path that was written, if any.
    Set {
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Relative ttl; every receiver computes its own deadline
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
        origin: Origin,
        timestamp: u64,
    },

    /// A key was deleted
    Delete {
        key: String,
        origin: Origin,
        timestamp: u64,
    },

    /// A connecting instance asks the manager for the current snapshot
    SyncRequest { origin: Origin, request_id: Uuid },

    /// Manager reply to a sync request
    SyncResponse {
        requester: Origin,
        request_id: Uuid,
        snapshot: Snapshot,
    },
}

impl Message {
    /// Origin of a mutation message
    pub fn origin(&self) -> &Origin {
        match self {
            Message::Set { origin, .. }
            | Message::Delete { origin, .. }
            | Message::SyncRequest { origin, .. } => origin,
            Message::SyncResponse { requester, .. } => requester,
        }
    }

    /// Application-order hint of mutation messages
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Message::Set { timestamp, .. } | Message::Delete { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Set { .. } => "Set",
            Message::Delete { .. } => "Delete",
            Message::SyncRequest { .. } => "SyncRequest",
            Message::SyncResponse { .. } => "SyncResponse",
        }
    }
}

/// A message addressed to one named store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Store name
    pub store: String,
    /// Payload
    pub message: Message,
}

impl Envelope {
    /// Wrap a message for `store`
    pub fn new(store: impl Into<String>, message: Message) -> Self {
        Self {
            store: store.into(),
            message,
        }
    }

    /// Serialize envelope to bytes
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("Failed to encode {}: {}", self.message.type_name(), e)))
    }

    /// Deserialize envelope from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(format!("Malformed envelope: {}", e)))
    }
}

/// Bus topic used by a named store
pub fn topic_for(store: &str) -> String {
    format!("wolfcache:{}", store)
}
