//! Instance lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a storage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Registering with the replication channel
    Connecting,
    /// Usable for reads, writes and sync
    Connected,
    /// Detached; the snapshot file is kept
    Closed,
    /// Detached, local data cleared and the snapshot file removed
    Destroyed,
}

impl InstanceState {
    /// Whether reads and writes are permitted
    pub fn is_open(&self) -> bool {
        matches!(self, InstanceState::Connecting | InstanceState::Connected)
    }

    /// Whether the instance has been closed or destroyed
    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Connecting => write!(f, "CONNECTING"),
            InstanceState::Connected => write!(f, "CONNECTED"),
            InstanceState::Closed => write!(f, "CLOSED"),
            InstanceState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}
