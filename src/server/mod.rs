//! Relay hub server: per-document fan-out rooms behind a websocket endpoint.

pub mod hub;
pub mod routes;

pub use hub::{RelayHub, Room, SessionId};
pub use routes::create_router;
