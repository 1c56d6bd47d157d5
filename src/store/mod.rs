//! Store Module
//!
//! The local key space of one storage instance, its entries and the
//! expiry machinery around it.

pub mod entry;
mod cache;
pub mod ttl;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cache::{Applied, EntryStore};
pub use entry::{is_expired, now_ms, Entry, Snapshot, Timestamp};
pub use ttl::{ExpiryQueue, ExpiryScheduler};

/// Lock a store mutex, ignoring poisoning
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
