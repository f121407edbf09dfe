use std::{
    collections::BTreeMap,
    io,
    sync::{atomic::Ordering, Arc},
    thread,
};

use parking_lot::{Mutex, RwLock};
use trace_wire::{CallMode, Command, InstrumentationMode, ModeChange, ProducerId, UnitId};

use super::{agent::Shared, AgentError};

/// Commands of the agent, sent on the control pseudo-channel. The lock is
/// private to the control channel, a command may come from any thread.
pub struct ControlChannel {
    shared: Arc<Shared>,
    lock: Mutex<()>,
}

impl ControlChannel {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        ControlChannel {
            shared,
            lock: Mutex::new(()),
        }
    }

    /// Returns once the command is written and the sink flushed. A `Flush`
    /// also asks every thread channel to flush at its next event.
    pub fn send(&self, command: Command) -> Result<(), AgentError> {
        let _guard = self.lock.lock();
        if let Command::Flush = command {
            self.shared.flush_epoch.fetch_add(1, Ordering::Relaxed);
        }
        let mut packet = self.shared.pool.take();
        command.encode(&mut packet);
        let sink = &self.shared.sink;
        if let Some(back) = sink.send(ProducerId::CONTROL, packet)? {
            self.shared.pool.put(back);
        }
        sink.flush()?;
        log::debug!("control {command:?}");
        Ok(())
    }
}

/// How a call site treats its callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallProtocol {
    /// Nothing is emitted around the call.
    Skip,
    /// The callee is opaque, only the boundary is emitted.
    Dry,
    /// Before and after the call, the callee emits its own enter.
    Full,
}

/// Monitoring modes as pushed by the collector, consulted by instrumented code.
#[derive(Default)]
pub struct DispatchTable {
    modes: RwLock<BTreeMap<UnitId, (InstrumentationMode, CallMode)>>,
}

impl DispatchTable {
    pub fn apply(&self, changes: &[ModeChange]) {
        let mut modes = self.modes.write();
        for change in changes {
            let entry = modes.entry(change.unit).or_default();
            if change.instrumentation < entry.0 || change.call < entry.1 {
                log::warn!(
                    "{} ignore demotion {:?} -> {:?}",
                    change.unit,
                    entry,
                    (change.instrumentation, change.call)
                );
                continue;
            }
            *entry = (change.instrumentation, change.call);
        }
    }

    pub fn mode(&self, unit: UnitId) -> (InstrumentationMode, CallMode) {
        self.modes.read().get(&unit).copied().unwrap_or_default()
    }

    pub fn protocol(&self, unit: UnitId) -> CallProtocol {
        match self.mode(unit) {
            (_, CallMode::Unmonitored) => CallProtocol::Skip,
            (InstrumentationMode::None, CallMode::Monitored) => CallProtocol::Dry,
            (_, CallMode::Monitored) => CallProtocol::Full,
        }
    }

    pub fn len(&self) -> usize {
        self.modes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads mode change batches from the reverse stream until it closes.
pub(crate) fn spawn_listener<R>(mut stream: R, shared: Arc<Shared>) -> io::Result<thread::JoinHandle<()>>
where
    R: io::Read + Send + 'static,
{
    thread::Builder::new()
        .name("trace-modes".to_owned())
        .spawn(move || loop {
            match ModeChange::read_batch(&mut stream) {
                Ok(Some(changes)) => {
                    log::debug!("apply {} mode changes", changes.len());
                    shared.dispatch.apply(&changes);
                }
                Ok(None) => {
                    log::info!("mode stream closed");
                    break;
                }
                Err(err) => {
                    log::error!("mode stream {err}");
                    break;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use trace_wire::{CallMode, InstrumentationMode, ModeChange, UnitId};

    use super::{CallProtocol, DispatchTable};

    fn change(unit: u32, instrumentation: InstrumentationMode, call: CallMode) -> ModeChange {
        ModeChange {
            unit: UnitId(unit),
            instrumentation,
            call,
        }
    }

    #[test]
    fn protocols() {
        let table = DispatchTable::default();
        table.apply(&[
            change(1, InstrumentationMode::None, CallMode::Monitored),
            change(2, InstrumentationMode::Envelope, CallMode::Monitored),
            change(3, InstrumentationMode::Full, CallMode::Unmonitored),
        ]);
        assert_eq!(table.protocol(UnitId(1)), CallProtocol::Dry);
        assert_eq!(table.protocol(UnitId(2)), CallProtocol::Full);
        assert_eq!(table.protocol(UnitId(3)), CallProtocol::Skip);
        assert_eq!(table.protocol(UnitId(4)), CallProtocol::Skip);
    }

    #[test]
    fn demotion_is_ignored() {
        let table = DispatchTable::default();
        table.apply(&[change(1, InstrumentationMode::Full, CallMode::Monitored)]);
        table.apply(&[change(1, InstrumentationMode::Envelope, CallMode::Monitored)]);
        assert_eq!(
            table.mode(UnitId(1)),
            (InstrumentationMode::Full, CallMode::Monitored)
        );
    }
}
