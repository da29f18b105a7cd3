//! Wire types for the tabops control channel.
//!
//! One [`Envelope`] per framed message. Clients open with [`Envelope::Hello`];
//! the server answers [`Envelope::HelloAck`] carrying the payload budget that
//! governs response chunking (see [`chunk`]).

mod chunk;
mod envelope;
mod error;

pub use chunk::{chunk_budget, reassemble, split_payload};
pub use envelope::{Envelope, EventName};
pub use error::{ErrorCode, WireError};

/// Protocol version spoken by this build. Hello/HelloAck must agree exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability strings advertised in HelloAck.
pub const CAPABILITIES: &[&str] = &["chunking", "events", "named_targets"];
