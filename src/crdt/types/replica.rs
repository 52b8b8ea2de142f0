//! Replica identifier type.
//!
//! Each editing session that can produce operations owns exactly one replica id
//! for the lifetime of the document it has open.

/// A unique identifier for each replica (editing session) in the distributed system.
///
/// Replica ids are assigned once per editing session and never reused within a
/// document's lifetime. Operations from different replicas are distinguished and
/// tie-broken by this id.
pub type ReplicaId = u64;
