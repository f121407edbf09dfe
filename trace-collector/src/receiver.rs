use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use trace_wire::{ModeChange, TypeId};

use super::{
    catalog::{StructureCatalog, TypeDef},
    config::{CollectorConfig, ConfigError},
    scope::{ScopeError, ScopeGraph},
    session::{Cx, Session, SessionError, SessionStats},
    store::TraceSink,
};

/// Byte stream of one producer process and its reverse stream for mode changes.
pub struct Connection {
    peer: String,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl Connection {
    /// The reader should not block, `WouldBlock` means no data yet.
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Connection {
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?.to_string();
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Connection::new(peer, stream, writer))
    }
}

/// What the receiver thread is fed with.
pub enum Input {
    Connection(Connection),
    /// The instrumentation layer loaded a type.
    LoadType(TypeDef),
}

pub type Observer = Box<dyn FnMut(&Session, Result<&SessionStats, &SessionError>) + Send>;

struct Active {
    connection: Connection,
    session: Session,
    outgoing: Vec<u8>,
    max_outgoing: usize,
    // the reverse stream failed, mode changes are not sent anymore
    deaf: bool,
}

impl Active {
    fn flush_outgoing(&mut self) {
        if self.deaf {
            self.outgoing.clear();
            return;
        }
        while !self.outgoing.is_empty() {
            match self.connection.writer.write(&self.outgoing) {
                Ok(0) => {
                    self.fail_writer(io::ErrorKind::WriteZero.into());
                    return;
                }
                Ok(n) => drop(self.outgoing.drain(..n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => {
                    self.fail_writer(err);
                    return;
                }
            }
        }
        match self.connection.writer.flush() {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (),
            Err(err) => self.fail_writer(err),
        }
    }

    fn fail_writer(&mut self, err: io::Error) {
        log::warn!(
            "session {} reverse stream failed, stop sending modes: {err}",
            self.session.id()
        );
        self.deaf = true;
        self.outgoing.clear();
    }

    fn queue(&mut self, changes: &[ModeChange]) {
        if self.deaf || changes.is_empty() {
            return;
        }
        if let Err(err) = ModeChange::write_batch(&mut self.outgoing, changes) {
            log::error!("encode mode changes: {err}");
        }
        if self.outgoing.len() > self.max_outgoing {
            let backlog = self.outgoing.len();
            self.fail_writer(io::Error::new(
                io::ErrorKind::Other,
                format!("{backlog} bytes of mode changes not drained"),
            ));
        }
    }
}

enum ReadOutcome {
    Progress,
    Idle,
    Closed(Result<(), SessionError>),
}

/// Drains every connection in turn on a single thread. The catalog and the
/// scope graph are only touched from here.
pub struct Receiver {
    config: CollectorConfig,
    catalog: StructureCatalog,
    scope: ScopeGraph,
    store: Box<dyn TraceSink + Send>,
    input: mpsc::Receiver<Input>,
    disconnected: bool,
    active: Vec<Active>,
    next_session: u64,
    observer: Option<Observer>,
    buf: Vec<u8>,
}

impl Receiver {
    pub fn new(
        config: CollectorConfig,
        store: Box<dyn TraceSink + Send>,
        input: mpsc::Receiver<Input>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut catalog = StructureCatalog::default();
        let scope = ScopeGraph::new(&mut catalog, &config.root_type, config.scope.clone());
        Ok(Receiver {
            buf: vec![0; config.read_buffer],
            config,
            catalog,
            scope,
            store,
            input,
            disconnected: false,
            active: vec![],
            next_session: 1,
            observer: None,
        })
    }

    /// Called with the outcome of every session once it closes.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Session, Result<&SessionStats, &SessionError>) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn catalog(&self) -> &StructureCatalog {
        &self.catalog
    }

    pub fn scope(&self) -> &ScopeGraph {
        &self.scope
    }

    pub fn sessions(&self) -> usize {
        self.active.len()
    }

    pub fn load_type(&mut self, def: &TypeDef) -> Result<TypeId, ScopeError> {
        let id = self.scope.load_type(&mut self.catalog, def)?;
        log::debug!("{id} {} loaded", def.name);
        Ok(id)
    }

    fn accept(&mut self, connection: Connection) {
        let id = self.next_session;
        self.next_session += 1;
        let mut session = Session::new(id, connection.peer.clone(), self.config.max_packet_size);
        let mut cx = Cx {
            catalog: &mut self.catalog,
            store: &mut *self.store,
        };
        if let Err(err) = session.start(&mut cx) {
            log::error!("session {id} cannot start: {err}");
            return;
        }
        let mut active = Active {
            connection,
            session,
            outgoing: vec![],
            max_outgoing: self.config.max_outgoing,
            deaf: false,
        };
        active.queue(&self.scope.snapshot(&self.catalog));
        active.flush_outgoing();
        self.active.push(active);
    }

    fn read(&mut self, index: usize) -> ReadOutcome {
        let active = &mut self.active[index];
        let mut cx = Cx {
            catalog: &mut self.catalog,
            store: &mut *self.store,
        };
        match active.connection.reader.read(&mut self.buf) {
            Ok(0) => ReadOutcome::Closed(Ok(())),
            Ok(n) => match active.session.on_data(&self.buf[..n], &mut cx) {
                Ok(()) if active.session.is_ended() => ReadOutcome::Closed(Ok(())),
                Ok(()) => ReadOutcome::Progress,
                Err(err) => ReadOutcome::Closed(Err(err)),
            },
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                ReadOutcome::Idle
            }
            Err(err) => ReadOutcome::Closed(Err(SessionError::Transport(err.into()))),
        }
    }

    fn close(&mut self, index: usize, outcome: Result<(), SessionError>) {
        let mut active = self.active.remove(index);
        let mut cx = Cx {
            catalog: &mut self.catalog,
            store: &mut *self.store,
        };
        let finished = active.session.finish(&mut cx);
        let result = match outcome {
            Ok(()) => finished,
            Err(err) => {
                if let Err(other) = finished {
                    log::warn!("session {} finish: {other}", active.session.id());
                }
                Err(err)
            }
        };
        let (id, peer) = (active.session.id(), active.session.peer());
        match &result {
            Ok(_) => log::info!("session {id} from {peer} closed"),
            Err(err) => log::error!("session {id} from {peer} failed: {err}"),
        }
        if let Some(observer) = &mut self.observer {
            observer(&active.session, result.as_ref());
        }
    }

    /// One round over the input and every connection, returns whether anything happened.
    pub fn poll(&mut self) -> bool {
        let mut progress = false;
        loop {
            match self.input.try_recv() {
                Ok(Input::Connection(connection)) => self.accept(connection),
                Ok(Input::LoadType(def)) => {
                    if let Err(err) = self.load_type(&def) {
                        log::error!("load {}: {err}", def.name);
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
            progress = true;
        }

        let mut index = 0;
        while index < self.active.len() {
            match self.read(index) {
                ReadOutcome::Progress => {
                    progress = true;
                    index += 1;
                }
                ReadOutcome::Idle => index += 1,
                ReadOutcome::Closed(outcome) => {
                    progress = true;
                    self.close(index, outcome);
                }
            }
        }

        if self.scope.has_changes() {
            let changes = self.scope.drain_changes();
            log::debug!("send {} mode changes to {} sessions", changes.len(), self.active.len());
            for active in &mut self.active {
                active.queue(&changes);
            }
        }
        for active in &mut self.active {
            active.flush_outgoing();
        }
        progress
    }

    /// Polls with a growing idle wait until stopped, or until the input is
    /// disconnected and every session is closed.
    pub fn run(&mut self, running: &AtomicBool) {
        let mut backoff = self.config.min_backoff;
        while running.load(Ordering::Relaxed) {
            if self.poll() {
                backoff = self.config.min_backoff;
                continue;
            }
            if self.disconnected && self.active.is_empty() {
                break;
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
        self.shutdown();
    }

    /// Finishes every open session.
    pub fn shutdown(&mut self) {
        while !self.active.is_empty() {
            self.close(0, Ok(()));
        }
        if let Err(err) = self.store.flush() {
            log::error!("flush store: {err}");
        }
    }
}

/// Accepts producers until stopped, the receiver sees its input disconnect after that.
pub fn spawn_acceptor(
    listener: TcpListener,
    input: mpsc::Sender<Input>,
    running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    thread::Builder::new()
        .name("trace-accept".to_owned())
        .spawn(move || {
            while running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("accept {addr}");
                        let connection = match Connection::tcp(stream) {
                            Ok(v) => v,
                            Err(err) => {
                                log::error!("setup {addr}: {err}");
                                continue;
                            }
                        };
                        if input.send(Input::Connection(connection)).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(err) => {
                        log::error!("accept: {err}");
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
}
