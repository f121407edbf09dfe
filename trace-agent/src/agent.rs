use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use trace_wire::{Command, ProducerId};

use super::{
    clock::Clock,
    control::{self, ControlChannel, DispatchTable},
    AgentConfig, AgentError, ObjectRegistry, PacketPool, PacketSink, StreamSink, ThreadChannel,
};

/// State every channel of the agent refers to.
pub(crate) struct Shared {
    pub config: AgentConfig,
    pub sink: Arc<dyn PacketSink>,
    pub registry: ObjectRegistry,
    pub clock: Clock,
    pub pool: PacketPool,
    pub dispatch: DispatchTable,
    pub capture: AtomicBool,
    // the sink failed, nothing more is sent
    pub broken: AtomicBool,
    // bumped by every flush command, channels flush at their next event
    pub flush_epoch: AtomicU64,
    next_producer: Mutex<u32>,
}

impl Shared {
    pub fn send(&self, producer: ProducerId, packet: Vec<u8>) {
        match self.sink.send(producer, packet) {
            Ok(Some(packet)) => self.pool.put(packet),
            Ok(None) => (),
            Err(err) => {
                log::error!("{producer} sink failed, stop sending: {err}");
                self.broken.store(true, Ordering::Relaxed);
            }
        }
    }

    fn next_producer(&self) -> ProducerId {
        let mut next = self.next_producer.lock();
        *next += 1;
        ProducerId(*next)
    }
}

pub struct Agent {
    shared: Arc<Shared>,
    control: ControlChannel,
    listener: Option<thread::JoinHandle<()>>,
}

impl Agent {
    pub fn new(config: AgentConfig, sink: Arc<dyn PacketSink>) -> Result<Self, AgentError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            clock: Clock::spawn(config.clock_tick),
            pool: PacketPool::new(config.packet_size, config.free_list_size),
            config,
            sink,
            registry: ObjectRegistry::default(),
            dispatch: DispatchTable::default(),
            capture: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            flush_epoch: AtomicU64::new(0),
            next_producer: Mutex::new(0),
        });
        Ok(Agent {
            control: ControlChannel::new(shared.clone()),
            shared,
            listener: None,
        })
    }

    /// Streams metapackets to a collector and applies the mode changes it sends back.
    pub fn connect<A>(addr: A, config: AgentConfig) -> Result<Self, AgentError>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reverse = stream.try_clone()?;
        let sink = Arc::new(StreamSink::new(stream, config.chunk_size));
        let mut agent = Agent::new(config, sink)?;
        agent.listen(reverse)?;
        Ok(agent)
    }

    pub fn listen<R>(&mut self, stream: R) -> io::Result<()>
    where
        R: io::Read + Send + 'static,
    {
        if self.listener.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "mode listener already running",
            ));
        }
        self.listener = Some(control::spawn_listener(stream, self.shared.clone())?);
        Ok(())
    }

    /// Opens the channel of a new instrumented thread.
    pub fn channel(&self, host_id: u64, name: &str) -> ThreadChannel {
        let producer = self.shared.next_producer();
        log::debug!("{producer} open, thread {host_id} {name}");
        let channel = ThreadChannel::new(producer, self.shared.clone());
        channel.register_thread(host_id, name);
        channel
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.shared.dispatch
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    pub fn capture(&self) -> bool {
        self.shared.capture.load(Ordering::Relaxed)
    }

    /// Disabled capture drops instrumentation events, registrations still go through.
    pub fn set_capture(&self, enabled: bool) -> Result<(), AgentError> {
        self.shared.capture.store(enabled, Ordering::Relaxed);
        self.control.send(Command::CaptureEnabled(enabled))
    }

    pub fn clear(&self) -> Result<(), AgentError> {
        self.control.send(Command::Clear)
    }

    /// Flushes the sink. Thread channels hand over their partial packets at
    /// their next event, a channel without further events flushes on drop.
    pub fn flush(&self) -> Result<(), AgentError> {
        self.control.send(Command::Flush)
    }

    /// Ends the session. Channels should be dropped before, so their packets are sent.
    pub fn end(self) -> Result<(), AgentError> {
        self.control.send(Command::End)?;
        if self.listener.is_some() {
            log::debug!("detach mode listener, it stops when the collector closes the stream");
        }
        Ok(())
    }
}
