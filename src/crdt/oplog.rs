//! Operation log: the basis of incremental synchronization.
//!
//! The log records every operation applied by this replica, in application
//! order, together with the replica's state vector. `delta_since` computes
//! exactly the operations a peer lacks given its vector: never omitting one it
//! needs, never resending one it has.

use crate::crdt::doc::Doc;
use crate::crdt::types::{OpId, Operation, StateVector};

/// Append-only operation log with a state-vector watermark.
///
/// Compaction may physically drop fully-observed tombstone operations (see
/// [`OpLog::compact`]); the `floor` vector records how far compaction has
/// advanced so callers can detect peers that need a synthesized full delta
/// instead of a log slice.
#[derive(Debug, Default)]
pub struct OpLog {
    ops: Vec<Operation>,
    vector: StateVector,
    floor: StateVector,
}

impl OpLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        OpLog::default()
    }

    /// Appends an applied operation and advances the watermark.
    pub fn append(&mut self, op: &Operation) {
        self.vector.record(op.id());
        self.ops.push(op.clone());
    }

    /// The state vector covering everything appended so far.
    pub fn vector(&self) -> &StateVector {
        &self.vector
    }

    /// The compaction floor. `delta_since` is exact only for peers whose
    /// vector dominates this.
    pub fn floor(&self) -> &StateVector {
        &self.floor
    }

    /// Number of operations currently retained.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if no operations are retained.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Exactly the operations whose `(replica, seq)` exceeds the peer's
    /// watermark for that replica.
    ///
    /// The caller must check [`OpLog::floor`] first: a peer below the floor may
    /// be owed operations this log no longer holds.
    pub fn delta_since(&self, peer: &StateVector) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|op| {
                let id = op.id();
                id.seq > peer.get(id.replica)
            })
            .cloned()
            .collect()
    }

    /// Drops operations for tombstoned elements that every known replica has
    /// observed (per `below`, typically the pointwise minimum of all peer
    /// vectors). Storage-only: never affects the visible sequence.
    ///
    /// An insert is dropped once its element is tombstoned and the insert plus
    /// all of its recorded deletes are covered by `below`; a delete is dropped
    /// once it and its target's insert are covered.
    pub fn compact(&mut self, below: &StateVector, doc: &Doc) {
        let covered_tombstone = |id: &OpId| -> bool {
            doc.elements()
                .iter()
                .find(|e| e.id == *id)
                .map(|e| {
                    e.is_deleted()
                        && below.observed(&e.id)
                        && e.deleted_by.iter().all(|d| below.observed(d))
                })
                .unwrap_or(false)
        };

        let before = self.ops.len();
        self.ops.retain(|op| match op {
            Operation::Insert { id, .. } => !covered_tombstone(id),
            Operation::Delete { id, target } => {
                !(below.observed(id) && covered_tombstone(target))
            }
        });
        if self.ops.len() != before {
            self.floor.merge(below);
        }
    }

    /// Rebuilds the log from regenerated history (used when resuming from a
    /// snapshot whose trailing log was truncated).
    pub fn rebuild_from(&mut self, ops: Vec<Operation>) {
        self.ops.clear();
        for op in &ops {
            self.vector.record(op.id());
        }
        self.ops = ops;
    }
}
