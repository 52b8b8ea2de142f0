//! Operation identifier for the sequence CRDT.
//!
//! Every operation ever created carries an `OpId`, which uniquely identifies it
//! system-wide and totally orders the operations of a single replica.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crdt::types::replica::ReplicaId;

/// A globally unique operation identifier: `(replica, seq)`.
///
/// `seq` is a strictly increasing per-replica counter starting at 1, so the pair
/// uniquely identifies every operation in the system. The derived ordering
/// (replica first, then seq) gives a deterministic total order used as the
/// tiebreaker for concurrent inserts into the same gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// The replica that created the operation.
    pub replica: ReplicaId,
    /// Position in that replica's operation stream, starting at 1.
    pub seq: u64,
}

impl OpId {
    /// Creates a new operation id.
    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        OpId { replica, seq }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seq, self.replica)
    }
}
