//! Wire models for both sides of the gateway.
//!
//! - `messages`: the Messages protocol spoken by our clients (requests and SSE events).
//! - `upstream`: the backend's UI-message request shape and its decoded stream events.

pub mod messages;
pub mod upstream;
