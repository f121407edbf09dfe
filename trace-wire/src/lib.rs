#![forbid(unsafe_code)]

/// Identifiers shared by the producer and the collector.
mod ids;
pub use self::ids::{ProducerId, ObjectId, TypeId, UnitId, FieldId, ProbeId, AdviceId, LoaderId};

/// Big-endian primitives, fixed-width records, length-prefixed text and the decode error.
pub mod codec;
pub use self::codec::{DecodeError, Fixed, Reader, WireWrite};

/// Tagged values and delta compression of object identities.
mod value;
pub use self::value::{Value, IdDelta};

/// Object graphs of values registered by value.
mod graph;
pub use self::graph::{ObjectGraph, ObjectNode, NodePayload, GraphValue};

/// Out-of-band commands and monitoring mode changes.
pub mod control;
pub use self::control::{Command, ModeChange, InstrumentationMode, CallMode};

/// Tagged messages carried inside a packet.
mod message;
pub use self::message::{Message, Tag, OutputStream, Messages};

/// Framing of packets into metapackets.
pub mod metapacket;
pub use self::metapacket::{MetaHeader, MetaFlags, HeaderParseError};

pub type Result<T> = std::result::Result<T, DecodeError>;
