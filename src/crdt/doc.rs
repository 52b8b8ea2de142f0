//! Core sequence CRDT implementation.
//!
//! `Doc` is the replicated ordered sequence backing one document's text. Local
//! edits produce self-describing operations; remote operations merge in any
//! delivery order. Two replicas that have applied the same set of operations
//! always compute the same visible sequence.
//!
//! # Integration
//!
//! Each insert records the elements immediately left and right of it at
//! creation time. A remote insert is placed by scanning the gap between its
//! recorded origins; concurrent inserts into the same gap are ordered
//! deterministically, with the lower replica id integrating to the left. This
//! resolves every conflict without negotiation.
//!
//! # Causal buffering
//!
//! An operation whose dependencies (origin elements, delete target, or the
//! preceding operation from its own replica) are missing is parked in a pending
//! map keyed by the missing id, and retried transitively whenever a new
//! operation lands. The transport is never assumed to be ordered.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crdt::element::Element;
use crate::crdt::types::{OpId, Operation, ReplicaId, StateVector};
use crate::error::OpError;

/// What `Doc::apply` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation was integrated into document state.
    Applied,
    /// A dependency is missing; the operation is parked until it arrives.
    Buffered,
    /// The operation was already applied; state is unchanged.
    Duplicate,
}

/// Result of applying one remote operation, including any previously buffered
/// operations that became applicable because of it.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Outcome for the operation passed to `apply`.
    pub outcome: ApplyOutcome,
    /// Every operation integrated during this call, in application order. This
    /// includes drained pending operations, so callers can log and persist
    /// exactly what changed.
    pub applied: Vec<Operation>,
}

/// Serializable document state: the element set in integrated order plus the
/// state vector. Everything needed to resume a replica or bootstrap a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub elements: Vec<Element>,
    pub vector: StateVector,
}

/// The replicated sequence CRDT for a single document.
pub struct Doc {
    /// This replica's identity for locally created operations.
    replica: ReplicaId,
    /// Next sequence number for a local operation.
    next_seq: u64,
    /// Elements in integrated (document) order, tombstones included.
    elements: Vec<Element>,
    /// Element id -> index into `elements`.
    index: HashMap<OpId, usize>,
    /// Highest contiguous sequence number applied per replica.
    vector: StateVector,
    /// Operations waiting on a missing dependency, keyed by the missing id.
    pending: HashMap<OpId, Vec<Operation>>,
}

impl Doc {
    /// Creates an empty document owned by `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        Doc {
            replica,
            next_seq: 1,
            elements: Vec::new(),
            index: HashMap::new(),
            vector: StateVector::new(),
            pending: HashMap::new(),
        }
    }

    /// Rebuilds a document from a snapshot, keeping `replica` as the local
    /// identity. The local sequence counter resumes past anything the snapshot
    /// already recorded for this replica.
    pub fn from_snapshot(replica: ReplicaId, snapshot: DocSnapshot) -> Self {
        let index = snapshot
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        let next_seq = snapshot.vector.next_seq(replica);
        Doc {
            replica,
            next_seq,
            elements: snapshot.elements,
            index,
            vector: snapshot.vector,
            pending: HashMap::new(),
        }
    }

    /// Captures the full document state (elements + vector).
    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            elements: self.elements.clone(),
            vector: self.vector.clone(),
        }
    }

    /// This replica's id.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// The current state vector.
    pub fn vector(&self) -> &StateVector {
        &self.vector
    }

    /// Number of operations parked waiting for dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Total number of elements, tombstones included.
    pub fn total_len(&self) -> usize {
        self.elements.len()
    }

    /// Number of visible (non-tombstoned) elements.
    pub fn visible_len(&self) -> usize {
        self.elements.iter().filter(|e| e.is_visible()).count()
    }

    /// The visible sequence as text.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| e.is_visible())
            .map(|e| e.content)
            .collect()
    }

    /// The visible sequence as element ids, in document order.
    pub fn visible_ids(&self) -> Vec<OpId> {
        self.elements
            .iter()
            .filter(|e| e.is_visible())
            .map(|e| e.id)
            .collect()
    }

    /// All elements in document order, tombstones included.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Creates and applies a local insert at `position` (in visible units).
    /// Positions past the end append. Returns the operation to broadcast.
    pub fn local_insert(&mut self, position: usize, content: char) -> Operation {
        let (origin_left, origin_right) = self.origins_at(position);
        let id = self.next_local_id();
        let op = Operation::Insert {
            id,
            origin_left,
            origin_right,
            content,
        };
        self.integrate_insert(Element::new(id, origin_left, origin_right, content));
        self.vector.record(id);
        op
    }

    /// Creates and applies local deletes covering `range` of the visible
    /// sequence, one operation per element. Out-of-range positions are ignored.
    pub fn local_delete(&mut self, range: std::ops::Range<usize>) -> Vec<Operation> {
        let targets: Vec<OpId> = self
            .visible_ids()
            .into_iter()
            .skip(range.start)
            .take(range.len())
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let id = self.next_local_id();
            let idx = self.index[&target];
            self.elements[idx].tombstone(id);
            self.vector.record(id);
            ops.push(Operation::Delete { id, target });
        }
        ops
    }

    /// Applies a remote operation.
    ///
    /// Returns the outcome for `op` itself plus every operation integrated as a
    /// consequence (the operation and any pending operations it unblocked).
    /// Duplicates are no-ops, missing dependencies buffer, and only operations
    /// that can never resolve fail.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyResult, OpError> {
        let mut applied = Vec::new();
        let outcome = self.apply_or_buffer(op, &mut applied)?;
        if outcome == ApplyOutcome::Applied {
            self.drain_pending(&mut applied);
        }
        Ok(ApplyResult { outcome, applied })
    }

    /// Advances the local sequence counter past everything already recorded
    /// for this replica. Must be called after replaying history into a fresh
    /// document, so a restarted replica never reissues an id it has already
    /// used.
    pub fn resume_local_seq(&mut self) {
        self.next_seq = self.next_seq.max(self.vector.next_seq(self.replica));
    }

    fn next_local_id(&mut self) -> OpId {
        let id = OpId::new(self.replica, self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Applies one operation or parks it; `applied` collects integrated ops.
    fn apply_or_buffer(
        &mut self,
        op: Operation,
        applied: &mut Vec<Operation>,
    ) -> Result<ApplyOutcome, OpError> {
        self.validate(&op)?;
        let id = op.id();

        if self.vector.observed(&id) {
            return Ok(ApplyOutcome::Duplicate);
        }

        if let Some(missing) = self.missing_dependency(&op)? {
            self.pending.entry(missing).or_default().push(op);
            return Ok(ApplyOutcome::Buffered);
        }

        match &op {
            Operation::Insert {
                id,
                origin_left,
                origin_right,
                content,
            } => {
                self.integrate_insert(Element::new(*id, *origin_left, *origin_right, *content));
            }
            Operation::Delete { id, target } => {
                let idx = self.index[target];
                self.elements[idx].tombstone(*id);
            }
        }
        self.vector.record(id);
        applied.push(op);
        Ok(ApplyOutcome::Applied)
    }

    /// Rejects operations that are malformed beyond repair: ids or references
    /// with a zero sequence number, or references to the operation's own
    /// replica at a sequence it cannot have produced yet.
    fn validate(&self, op: &Operation) -> Result<(), OpError> {
        let id = op.id();
        let unresolvable = |missing: OpId| OpError::UnknownReplica { op: id, missing };

        if id.seq == 0 {
            return Err(unresolvable(id));
        }

        let refs: [Option<OpId>; 2] = match op {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => [*origin_left, *origin_right],
            Operation::Delete { target, .. } => [Some(*target), None],
        };
        for r in refs.into_iter().flatten() {
            if r.seq == 0 || (r.replica == id.replica && r.seq >= id.seq) {
                return Err(unresolvable(r));
            }
        }
        Ok(())
    }

    /// Finds the first missing dependency of `op`, or errors if a dependency
    /// was applied but never created an element (it can never resolve).
    fn missing_dependency(&self, op: &Operation) -> Result<Option<OpId>, OpError> {
        let id = op.id();

        // Per-replica contiguity: the previous operation from the same replica
        // must land first so the state vector stays a contiguous watermark.
        if id.seq > self.vector.next_seq(id.replica) {
            return Ok(Some(OpId::new(id.replica, id.seq - 1)));
        }

        let required: [Option<OpId>; 2] = match op {
            Operation::Insert {
                origin_left,
                origin_right,
                ..
            } => [*origin_left, *origin_right],
            Operation::Delete { target, .. } => [Some(*target), None],
        };
        for r in required.into_iter().flatten() {
            if !self.index.contains_key(&r) {
                if self.vector.observed(&r) {
                    // The referenced operation was applied but is not an
                    // element (e.g. an insert claiming a delete as origin).
                    return Err(OpError::UnknownReplica { op: id, missing: r });
                }
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    /// Retries parked operations until no further progress is possible.
    fn drain_pending(&mut self, applied: &mut Vec<Operation>) {
        loop {
            let ready: Vec<OpId> = self
                .pending
                .keys()
                .filter(|id| self.vector.observed(id))
                .copied()
                .collect();
            if ready.is_empty() {
                break;
            }

            let mut progressed = false;
            for key in ready {
                let Some(ops) = self.pending.remove(&key) else {
                    continue;
                };
                for op in ops {
                    match self.apply_or_buffer(op, applied) {
                        Ok(ApplyOutcome::Applied) => progressed = true,
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "dropping unresolvable buffered operation"),
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Places a new element between its recorded origins.
    ///
    /// Scans the gap between `origin_left` and `origin_right`; among elements
    /// that were inserted concurrently into the same gap, the lower replica id
    /// wins the position further left. All replicas run the same scan and
    /// converge on one total order.
    fn integrate_insert(&mut self, el: Element) {
        let left_origin_idx = el.origin_left.map(|id| self.index[&id]);
        let right_idx = el
            .origin_right
            .map(|id| self.index[&id])
            .unwrap_or(self.elements.len());

        let mut left = left_origin_idx;
        let mut items_before_origin: HashSet<OpId> = HashSet::new();
        let mut conflicting: HashSet<OpId> = HashSet::new();

        let scan_from = left_origin_idx.map_or(0, |i| i + 1);
        for o in scan_from..right_idx {
            let c = &self.elements[o];
            items_before_origin.insert(c.id);
            conflicting.insert(c.id);

            if c.origin_left == el.origin_left {
                // Same left origin: the element is a direct conflict. Lower
                // replica id stays left; if the right origins also match, every
                // later element sorts after us and the scan can stop.
                if c.id.replica < el.id.replica {
                    left = Some(o);
                    conflicting.clear();
                } else if c.origin_right == el.origin_right {
                    break;
                }
            } else if let Some(c_origin) = c.origin_left {
                if items_before_origin.contains(&c_origin) {
                    // The element hangs off something inside the conflict
                    // window; it stays with its parent's side of the order.
                    if !conflicting.contains(&c_origin) {
                        left = Some(o);
                        conflicting.clear();
                    }
                } else {
                    break;
                }
            } else {
                break;
            }
        }

        let dest = left.map_or(0, |i| i + 1);
        for idx in self.index.values_mut() {
            if *idx >= dest {
                *idx += 1;
            }
        }
        self.index.insert(el.id, dest);
        self.elements.insert(dest, el);
    }

    /// Origins for a local insert at visible `position`: the visible
    /// predecessor and its physical successor (which may be a tombstone).
    fn origins_at(&self, position: usize) -> (Option<OpId>, Option<OpId>) {
        if position == 0 {
            return (None, self.elements.first().map(|e| e.id));
        }
        let mut seen = 0;
        for (i, e) in self.elements.iter().enumerate() {
            if e.is_visible() {
                seen += 1;
                if seen == position {
                    return (Some(e.id), self.elements.get(i + 1).map(|e| e.id));
                }
            }
        }
        (self.elements.last().map(|e| e.id), None)
    }

    /// Regenerates the complete operation history from document state: one
    /// insert per element plus one delete per recorded tombstone id. Used to
    /// bootstrap peers whose state vector predates log compaction.
    pub fn history_ops(&self) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(self.elements.len());
        for e in &self.elements {
            ops.push(Operation::Insert {
                id: e.id,
                origin_left: e.origin_left,
                origin_right: e.origin_right,
                content: e.content,
            });
            for d in &e.deleted_by {
                ops.push(Operation::Delete {
                    id: *d,
                    target: e.id,
                });
            }
        }
        ops
    }
}
