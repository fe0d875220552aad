//! Wire protocol: newline-delimited JSON framing and typed envelopes.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
