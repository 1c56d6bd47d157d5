//! Storage Module
//!
//! Named store instances: options, lifecycle state and the [`Storage`]
//! handle combining the entry store, replication, TTL scheduling and
//! snapshot persistence.

mod instance;
mod options;
mod state;

pub use instance::Storage;
pub use options::StorageOptions;
pub use state::InstanceState;
