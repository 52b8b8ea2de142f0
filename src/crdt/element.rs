//! Element definition for the sequence CRDT.
//!
//! An element is a logical position in the sequence, created by exactly one
//! insert operation and identified forever by that operation's id. Deletion is
//! logical: tombstoned elements stay in the sequence so that late-arriving
//! concurrent operations can still resolve their origin references.

use serde::{Deserialize, Serialize};

use crate::crdt::types::OpId;

/// A single content unit within the replicated sequence.
///
/// The origin pointers are recorded at creation and never mutated afterwards;
/// they are used only for conflict ordering during integration, not for
/// traversal. Every delete operation observed for this element is recorded in
/// `deleted_by`, which makes the full operation history reconstructible from
/// the element set alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// Id of the insert operation that created this element.
    pub id: OpId,
    /// Element immediately to the left at creation time (None = document start).
    pub origin_left: Option<OpId>,
    /// Element immediately to the right at creation time (None = document end).
    pub origin_right: Option<OpId>,
    /// The content unit.
    pub content: char,
    /// Ids of every delete operation observed for this element, kept sorted so
    /// converged replicas hold identical elements regardless of delivery
    /// order. Non-empty means tombstoned; a tombstone is never cleared.
    pub deleted_by: Vec<OpId>,
}

impl Element {
    /// Creates a live element from its insert operation's fields.
    pub fn new(
        id: OpId,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
        content: char,
    ) -> Self {
        Element {
            id,
            origin_left,
            origin_right,
            content,
            deleted_by: Vec::new(),
        }
    }

    /// Whether this element is tombstoned.
    pub fn is_deleted(&self) -> bool {
        !self.deleted_by.is_empty()
    }

    /// Records a delete operation targeting this element. Idempotent: a delete
    /// id already recorded is ignored, and the tombstone state never reverts.
    pub fn tombstone(&mut self, delete_id: OpId) {
        if let Err(pos) = self.deleted_by.binary_search(&delete_id) {
            self.deleted_by.insert(pos, delete_id);
        }
    }

    /// Whether this element contributes to the visible sequence.
    pub fn is_visible(&self) -> bool {
        !self.is_deleted()
    }
}
