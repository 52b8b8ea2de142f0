//! Sequence CRDT implementation module.
//!
//! This module contains the replicated sequence (the document's text), the
//! operation log used for incremental sync, and all supporting types.

pub mod doc;
pub mod element;
pub mod oplog;
pub mod types;

pub use doc::{ApplyOutcome, ApplyResult, Doc, DocSnapshot};
pub use element::Element;
pub use oplog::OpLog;
pub use types::{OpId, Operation, ReplicaId, StateVector};
