//! Manager Role
//!
//! Exactly one process of the cluster is "manager" at any instant and owns
//! flush and purge duty. The election itself happens elsewhere; this module
//! only defines how the answer is queried. Callers ask at every decision
//! point and never cache the result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Query capability answering whether this process currently holds the
/// manager role
pub trait ManagerRole: Send + Sync {
    /// Non-blocking; may change between two calls
    fn is_manager(&self) -> bool;
}

impl<F> ManagerRole for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_manager(&self) -> bool {
        self()
    }
}

/// Role flag flipped by an external election driver
#[derive(Debug, Clone, Default)]
pub struct SharedRole {
    flag: Arc<AtomicBool>,
}

impl SharedRole {
    /// Create a role flag with the given initial value
    pub fn new(is_manager: bool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(is_manager)),
        }
    }

    /// Grant or revoke the manager role
    pub fn set(&self, is_manager: bool) {
        let previous = self.flag.swap(is_manager, Ordering::SeqCst);
        if previous != is_manager {
            tracing::info!(
                "Manager role {}",
                if is_manager { "acquired" } else { "released" }
            );
        }
    }
}

impl ManagerRole for SharedRole {
    fn is_manager(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Role that never changes
#[derive(Debug, Clone, Copy)]
pub struct FixedRole(pub bool);

impl ManagerRole for FixedRole {
    fn is_manager(&self) -> bool {
        self.0
    }
}
