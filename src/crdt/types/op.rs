//! Operation definitions for the sequence CRDT.
//!
//! An operation is an atomic edit: an insert of a single content unit between
//! two origin elements, or a tombstoning delete of an existing element. Every
//! operation is self-describing (it carries its own id and the ids of the
//! elements it depends on), so operations can be delivered in any order over an
//! unordered transport and re-sequenced by causal buffering.

use serde::{Deserialize, Serialize};

use crate::crdt::types::op_id::OpId;

/// An atomic edit to the replicated sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Inserts `content` logically between the elements identified by
    /// `origin_left` and `origin_right` at creation time. `None` origins denote
    /// the document start/end boundaries.
    Insert {
        id: OpId,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        content: char,
    },
    /// Marks the element created by `target` as removed. Redundant deletes of
    /// an already-tombstoned element are accepted as no-ops.
    Delete { id: OpId, target: OpId },
}

impl Operation {
    /// The unique id carried by this operation.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } => *id,
            Operation::Delete { id, .. } => *id,
        }
    }

    /// Returns true for insert operations.
    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}
