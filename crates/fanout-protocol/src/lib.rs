//! Shared signaling protocol for the Fanout relay.
//!
//! The relay and its clients exchange every control message over one
//! WebSocket using the envelope defined here.

pub mod messages;

pub use messages::SignalMessage;
