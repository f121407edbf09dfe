#![forbid(unsafe_code)]

/// Types and executable units known to the collector, with their monitoring modes.
pub mod catalog;
pub use self::catalog::{StructureCatalog, TypeDef, UnitDef, MonitoringMode, HasTrace, CatalogError};

/// Which units are traced. Units that may dispatch to each other share a group
/// and the group decides their modes.
pub mod scope;
pub use self::scope::{ScopeGraph, ScopeFilter, ScopeError};

/// Metapackets back to packets.
mod transport;
pub use self::transport::{Transport, TransportError, TransportStats, MetapacketParser, Reassembler};

/// Rebuilds the call stack of each producer from its messages.
mod interpreter;
pub use self::interpreter::{EventInterpreter, TraceEvent, EventKind};

/// Where decoded records end up.
mod store;
pub use self::store::{Record, TraceSink, MemoryStore, JsonStore};

/// State of one producer process connection.
mod session;
pub use self::session::{Session, SessionError, SessionStats, Cx};

mod config;
pub use self::config::{CollectorConfig, ConfigError};

/// Single thread draining every connection.
mod receiver;
pub use self::receiver::{Receiver, Connection, Input, Observer, spawn_acceptor};
