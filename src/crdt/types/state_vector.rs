//! State vector: per-replica watermark of applied operations.
//!
//! A state vector maps each known replica to the highest contiguous sequence
//! number applied from it. Two replicas exchange state vectors during the sync
//! handshake to compute exactly the operations the other side lacks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crdt::types::op_id::OpId;
use crate::crdt::types::replica::ReplicaId;

/// Per-replica watermark recording the highest contiguous operation sequence
/// number applied from each replica.
///
/// Entries only ever increase; a replica absent from the map has an implicit
/// watermark of 0 (nothing applied).
///
/// On the wire and on disk a vector is a sorted list of `[replica, seq]`
/// pairs: JSON objects cannot have numeric keys, and the pair form stays
/// stable inside enveloping message types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(ReplicaId, u64)>", into = "Vec<(ReplicaId, u64)>")]
pub struct StateVector(HashMap<ReplicaId, u64>);

impl From<Vec<(ReplicaId, u64)>> for StateVector {
    fn from(entries: Vec<(ReplicaId, u64)>) -> Self {
        StateVector(entries.into_iter().filter(|(_, seq)| *seq > 0).collect())
    }
}

impl From<StateVector> for Vec<(ReplicaId, u64)> {
    fn from(vector: StateVector) -> Self {
        let mut entries: Vec<_> = vector.0.into_iter().collect();
        entries.sort_unstable();
        entries
    }
}

impl StateVector {
    /// Creates an empty state vector (nothing observed from anyone).
    pub fn new() -> Self {
        StateVector(HashMap::new())
    }

    /// The highest contiguous sequence number applied from `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    /// The next sequence number expected from `replica`.
    pub fn next_seq(&self, replica: ReplicaId) -> u64 {
        self.get(replica) + 1
    }

    /// Whether the operation identified by `id` is covered by this vector.
    pub fn observed(&self, id: &OpId) -> bool {
        id.seq != 0 && id.seq <= self.get(id.replica)
    }

    /// Records `id` as applied. Watermarks are monotonic: recording an id at or
    /// below the current watermark is a no-op.
    pub fn record(&mut self, id: OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        if id.seq > *entry {
            *entry = id.seq;
        }
    }

    /// Whether this vector covers everything `other` covers.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(r, s)| self.get(*r) >= *s)
    }

    /// Raises each watermark to at least the corresponding entry of `other`.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, seq) in &other.0 {
            let entry = self.0.entry(*replica).or_insert(0);
            if *seq > *entry {
                *entry = *seq;
            }
        }
    }

    /// Pointwise minimum with `other`: the operations every holder of either
    /// vector has observed. Used to gate tombstone compaction on "seen by all".
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let mut out = HashMap::new();
        for (replica, seq) in &self.0 {
            let min = (*seq).min(other.get(*replica));
            if min > 0 {
                out.insert(*replica, min);
            }
        }
        StateVector(out)
    }

    /// Iterates over `(replica, watermark)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, s)| (*r, *s))
    }

    /// True if nothing has been observed from any replica.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_observed() {
        let mut sv = StateVector::new();
        assert!(!sv.observed(&OpId::new(1, 1)));
        assert_eq!(sv.next_seq(1), 1);

        sv.record(OpId::new(1, 1));
        sv.record(OpId::new(1, 2));
        assert!(sv.observed(&OpId::new(1, 1)));
        assert!(sv.observed(&OpId::new(1, 2)));
        assert!(!sv.observed(&OpId::new(1, 3)));
        assert_eq!(sv.next_seq(1), 3);
    }

    #[test]
    fn test_watermarks_only_increase() {
        let mut sv = StateVector::new();
        sv.record(OpId::new(1, 5));
        sv.record(OpId::new(1, 3));
        assert_eq!(sv.get(1), 5);
    }

    #[test]
    fn test_seq_zero_never_observed() {
        let mut sv = StateVector::new();
        sv.record(OpId::new(1, 5));
        assert!(!sv.observed(&OpId::new(1, 0)));
    }

    #[test]
    fn test_dominates() {
        let mut a = StateVector::new();
        let mut b = StateVector::new();
        a.record(OpId::new(1, 3));
        a.record(OpId::new(2, 1));
        b.record(OpId::new(1, 2));

        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.dominates(&StateVector::new()));
    }

    #[test]
    fn test_merge_and_meet() {
        let mut a = StateVector::new();
        let mut b = StateVector::new();
        a.record(OpId::new(1, 3));
        b.record(OpId::new(1, 5));
        b.record(OpId::new(2, 2));

        let meet = a.meet(&b);
        assert_eq!(meet.get(1), 3);
        assert_eq!(meet.get(2), 0);

        a.merge(&b);
        assert_eq!(a.get(1), 5);
        assert_eq!(a.get(2), 2);
    }

    #[test]
    fn test_json_round_trip() {
        let mut sv = StateVector::new();
        sv.record(OpId::new(1, 3));
        sv.record(OpId::new(9, 12));

        let json = serde_json::to_string(&sv).unwrap();
        let back: StateVector = serde_json::from_str(&json).unwrap();
        assert_eq!(sv, back);
    }

    #[test]
    fn test_json_form_is_sorted_entry_pairs() {
        let mut sv = StateVector::new();
        sv.record(OpId::new(9, 12));
        sv.record(OpId::new(1, 3));
        assert_eq!(serde_json::to_string(&sv).unwrap(), "[[1,3],[9,12]]");

        // Round-trips even when nested inside a tagged envelope, which is how
        // it travels in handshake messages.
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        #[serde(tag = "type")]
        enum Envelope {
            V { vector: StateVector },
        }
        let env = Envelope::V { vector: sv };
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(serde_json::from_str::<Envelope>(&json).unwrap(), env);
    }
}
