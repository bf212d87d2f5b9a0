//! Stream multiplexing layer
//!
//! Provides:
//! - Frame encoding/decoding and packet-level encryption
//! - The mux runtime (reader and writer workers, stream table)
//! - Multiplexed streams with deadlines and graceful shutdown

pub(crate) mod frame;
pub(crate) mod packet;
mod multiplexer;
mod stream;

pub use multiplexer::Mux;
pub use stream::Stream;

/// Stream ids below this value are reserved for the protocol.
pub(crate) const ID_LOWEST_STREAM: u32 = 1 << 8;

/// Maximum number of live entries in the stream table.
pub(crate) const MAX_STREAMS: usize = 1 << 20;

/// Stream ids wrap back around to the reserved boundary once they reach
/// this value.
pub(crate) const ID_WRAP_POINT: u32 = u32::MAX >> 2;
