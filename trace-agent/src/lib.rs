#![forbid(unsafe_code)]

mod error;
pub use self::error::{AgentError, fatal};

mod config;
pub use self::config::AgentConfig;

/// Coarse logical clock shared by all channels of the agent.
mod clock;
pub use self::clock::{Clock, ClockCursor};

/// Identity of captured objects.
mod registry;
pub use self::registry::{ObjectRegistry, ObjectKey, HostValue, HostObject, HostContents};

mod buffer;
pub use self::buffer::PacketPool;

mod sink;
pub use self::sink::{PacketSink, StreamSink, MemorySink};

/// Per-thread event emission.
mod channel;
pub use self::channel::ThreadChannel;

/// Out-of-band commands and monitoring modes pushed back by the collector.
mod control;
pub use self::control::{ControlChannel, DispatchTable, CallProtocol};

mod agent;
pub use self::agent::Agent;
