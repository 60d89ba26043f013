//! Wire data model for the Rotonde message bus.
//!
//! Peers on a Rotonde bus exchange six kinds of packets over a persistent
//! text channel:
//! - `event` / `action`: an identifier plus opaque structured data
//! - `def` / `undef`: publish or retract the schema of an identifier
//! - `sub` / `unsub`: ask the remote side to start or stop delivering an event
//!
//! Every packet is a single JSON object `{"type": ..., "payload": ...}`.
//! Payload shapes are described by [`Definition`]s but never validated here.

mod definition;
mod packet;

pub use definition::{Category, Definition, Field};
pub use packet::{Action, Event, Packet, PacketType, Subscription};

/// Reserved identifier whose handlers receive every dispatch.
pub const WILDCARD: &str = "*";

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
