//! Perch Protocol
//!
//! Defines the types that cross the host/runtime boundary: events delivered
//! to the scripted computer, boot lifecycle states, power requests, and
//! fault diagnostics. This crate is the source of truth for that surface
//! and carries no interpreter dependency.

mod events;
mod types;

pub use events::*;
pub use types::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;
