//! Data channel protocol
//!
//! Defines how application payloads are framed on the open channel.

pub mod payload;

pub use payload::{decode, encode};
