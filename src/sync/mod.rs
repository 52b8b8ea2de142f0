//! Synchronization protocol: wire messages and the per-connection session.

pub mod protocol;
pub mod session;

pub use protocol::WireMessage;
pub use session::{ReconnectBackoff, SessionState, SyncSession};
