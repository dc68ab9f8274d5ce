//! Protocol-client abstractions: the ports the core drives and the event
//! model it consumes.

pub mod port;
pub mod types;
