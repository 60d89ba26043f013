//! Packets exchanged on the bus.
//!
//! A packet is decoded by reading its `type` tag first and then parsing the
//! payload shape that tag implies; a payload that does not match fails to
//! decode.

use crate::{Definition, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An event instance broadcast by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub identifier: String,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Creates a new event.
    pub fn new(identifier: impl Into<String>, data: Value) -> Self {
        Self {
            identifier: identifier.into(),
            data,
        }
    }
}

/// An action requested from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub identifier: String,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    /// Creates a new action.
    pub fn new(identifier: impl Into<String>, data: Value) -> Self {
        Self {
            identifier: identifier.into(),
            data,
        }
    }
}

/// Payload of `sub` and `unsub` packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub identifier: String,
}

impl Subscription {
    /// Creates a new subscription payload.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

/// The wire tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Action,
    Event,
    Definition,
    UnDefinition,
    Subscribe,
    Unsubscribe,
}

impl PacketType {
    /// The value of the `type` key for this packet type.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Action => "action",
            PacketType::Event => "event",
            PacketType::Definition => "def",
            PacketType::UnDefinition => "undef",
            PacketType::Subscribe => "sub",
            PacketType::Unsubscribe => "unsub",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Packet {
    #[serde(rename = "event")]
    Event(Event),
    #[serde(rename = "action")]
    Action(Action),
    #[serde(rename = "def")]
    Definition(Definition),
    #[serde(rename = "undef")]
    UnDefinition(Definition),
    #[serde(rename = "sub")]
    Subscribe(Subscription),
    #[serde(rename = "unsub")]
    Unsubscribe(Subscription),
}

impl Packet {
    /// Returns the wire tag of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Event(_) => PacketType::Event,
            Packet::Action(_) => PacketType::Action,
            Packet::Definition(_) => PacketType::Definition,
            Packet::UnDefinition(_) => PacketType::UnDefinition,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
        }
    }

    /// Returns the identifier carried by the payload.
    pub fn identifier(&self) -> &str {
        match self {
            Packet::Event(e) => &e.identifier,
            Packet::Action(a) => &a.identifier,
            Packet::Definition(d) | Packet::UnDefinition(d) => &d.identifier,
            Packet::Subscribe(s) | Packet::Unsubscribe(s) => &s.identifier,
        }
    }

    /// Serializes the packet to its JSON text form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a packet from JSON text.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
