//! Replication Module
//!
//! Broadcasts local mutations to the other instances of a named store and
//! delivers theirs back, plus the sync request/response exchange used to
//! resynchronize from the manager.

pub mod protocol;
mod channel;

pub use channel::{Inbound, ReplicationChannel};
pub use protocol::{topic_for, Envelope, Message, Origin};
