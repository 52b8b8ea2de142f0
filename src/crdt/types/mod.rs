//! Type definitions for the sequence CRDT.
//!
//! This module contains the fundamental types used throughout the engine,
//! organized into focused submodules.

pub mod op;
pub mod op_id;
pub mod replica;
pub mod state_vector;

pub use op::Operation;
pub use op_id::OpId;
pub use replica::ReplicaId;
pub use state_vector::StateVector;
