//! WolfCache - Replicated Key-Value Storage
//!
//! Named, in-memory key-value stores kept in sync between cooperating
//! processes by broadcasting every mutation over a shared bus, with
//! optional per-key (and per-field) expiry and a JSON snapshot on disk
//! that only the elected manager process writes.
//!
//! # Architecture
//!
//! Every process holds a full copy of each store it opens. Local reads and
//! writes are synchronous; the resulting SET/DELETE messages are queued and
//! broadcast in the background. Replication is best-effort with no global
//! order, and `sync()` recovers a diverged instance by replacing its content
//! with the manager's snapshot.
//!
//! # Features
//!
//! - Synchronous local `set`/`get`/`has`/`delete` with nested paths (`bar.name`)
//! - Whole-entry and field-level TTL, with lazy and periodic expiry
//! - Fire-and-forget replication over any [`transport::Bus`]
//! - Manager-only, atomically replaced snapshot files
//! - Idempotent `close`/`destroy` lifecycle

pub mod config;
pub mod error;
pub mod path;
pub mod persistence;
pub mod replication;
pub mod role;
pub mod storage;
pub mod store;
pub mod transport;

pub use config::WolfCacheConfig;
pub use error::{Error, Result};
pub use storage::{InstanceState, Storage, StorageOptions};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfCacheConfig;
    pub use crate::error::{Error, Result};
    pub use crate::role::{FixedRole, ManagerRole, SharedRole};
    pub use crate::storage::{InstanceState, Storage, StorageOptions};
    pub use crate::store::Snapshot;
    pub use crate::transport::{Bus, LocalBus, StreamBus};
}
