//! # doc-sync: real-time collaborative document synchronization
//!
//! A replicated ordered sequence (one document's text) that multiple editing
//! sessions can mutate concurrently, converging without a central lock,
//! surviving offline edits, and re-synchronizing on reconnect.
//!
//! ## Features
//!
//! - **Conflict-free**: concurrent operations merge in any delivery order and
//!   all replicas converge on the same visible sequence
//! - **Causally consistent**: operations carry their dependencies; out-of-order
//!   delivery is buffered, never rejected
//! - **Incremental sync**: state vectors let two peers exchange exactly the
//!   operations the other lacks
//! - **Durable**: an append-only operation log plus snapshots let a client
//!   resume offline work without replaying full history
//! - **Tombstone-based deletion**: logical deletes keep late-arriving
//!   concurrent operations resolvable
//!
//! ## Example
//!
//! ```rust
//! use doc_sync::Doc;
//!
//! let mut doc = Doc::new(1); // replica ID = 1
//! doc.local_insert(0, 'h');
//! doc.local_insert(1, 'i');
//! assert_eq!(doc.text(), "hi");
//! ```

pub mod crdt;
pub mod engine;
pub mod error;
pub mod presence;
pub mod server;
pub mod store;
pub mod sync;

// Re-export the main public API.
pub use crdt::{ApplyOutcome, Doc, DocSnapshot, Element, OpId, OpLog, Operation, ReplicaId, StateVector};
pub use engine::{ChangeNotice, DocumentEngine};
pub use error::{EngineError, OpError, StoreError, TransportError};
pub use presence::{PresenceChannel, PresenceRecord, PresenceUpdate};
pub use server::{RelayHub, Room, create_router};
pub use store::DocStore;
pub use sync::{ReconnectBackoff, SessionState, SyncSession, WireMessage};
