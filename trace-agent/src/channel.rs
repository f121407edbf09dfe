use std::{
    cell::{Cell, RefCell, RefMut},
    collections::BTreeSet,
    mem,
    sync::{atomic::Ordering, Arc},
};

use trace_wire::{
    AdviceId, FieldId, IdDelta, Message, OutputStream, ProbeId, ProducerId, TypeId, LoaderId,
    UnitId,
};

use super::{
    agent::Shared,
    buffer,
    clock::ClockCursor,
    fatal,
    registry::{Converter, HostValue, ObjectKey, Pending},
};

struct ChannelState {
    packet: Vec<u8>,
    ids: IdDelta,
    pending: Vec<Pending>,
    // objects registered in `packet`, marked sent once it reaches the sink
    carried: BTreeSet<ObjectKey>,
    // last flush request of the agent this channel has honored
    flush_epoch: u64,
    clock: ClockCursor,
    call_stack: Vec<UnitId>,
}

/// Event emission of one instrumented thread. Not `Sync`, every thread owns its channel.
pub struct ThreadChannel {
    producer: ProducerId,
    shared: Arc<Shared>,
    state: RefCell<ChannelState>,
    // set while host objects are being converted, events raised meanwhile are dropped
    converting: Cell<bool>,
}

/// Exclusive access to the channel for the duration of one event.
struct EventGuard<'a> {
    channel: &'a ThreadChannel,
    state: RefMut<'a, ChannelState>,
}

impl ThreadChannel {
    pub(crate) fn new(producer: ProducerId, shared: Arc<Shared>) -> Self {
        let packet = shared.pool.take();
        let flush_epoch = shared.flush_epoch.load(Ordering::Relaxed);
        ThreadChannel {
            producer,
            shared,
            state: RefCell::new(ChannelState {
                packet,
                ids: IdDelta::default(),
                pending: vec![],
                carried: BTreeSet::new(),
                flush_epoch,
                clock: ClockCursor::default(),
                call_stack: vec![],
            }),
            converting: Cell::new(false),
        }
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    /// The unit currently executing on this thread, as far as enter/exit events tell.
    pub fn current_unit(&self) -> Option<UnitId> {
        self.state
            .try_borrow()
            .ok()
            .and_then(|s| s.call_stack.last().copied())
    }

    pub fn depth(&self) -> usize {
        self.state.try_borrow().map_or(0, |s| s.call_stack.len())
    }

    fn begin(&self) -> Option<EventGuard<'_>> {
        if self.converting.get() {
            log::debug!("{} drop nested event during value registration", self.producer);
            return None;
        }
        if self.shared.broken.load(Ordering::Relaxed) {
            return None;
        }
        match self.state.try_borrow_mut() {
            Ok(state) => Some(EventGuard {
                channel: self,
                state,
            }),
            Err(_) => fatal(format_args!("{} event re-entered", self.producer)),
        }
    }

    fn capturing(&self) -> bool {
        self.shared.capture.load(Ordering::Relaxed)
    }

    fn event<F>(&self, f: F)
    where
        F: FnOnce(u64, &mut Converter<'_>) -> Message,
    {
        if !self.capturing() {
            return;
        }
        if let Some(mut guard) = self.begin() {
            let msg = guard.build(f);
            guard.finish(msg);
        }
    }

    fn registration(&self, msg: Message) {
        if let Some(guard) = self.begin() {
            guard.finish(msg);
        }
    }

    pub fn register_thread(&self, host_id: u64, name: &str) {
        self.registration(Message::RegisterThread {
            host_id,
            name: name.to_owned(),
        });
    }

    pub fn register_type(&self, id: TypeId, loader: LoaderId, name: &str) {
        self.registration(Message::RegisterType {
            id,
            loader,
            name: name.to_owned(),
        });
    }

    pub fn register_loader(&self, id: LoaderId, parent: LoaderId, name: &str) {
        self.registration(Message::RegisterLoader {
            id,
            parent,
            name: name.to_owned(),
        });
    }

    pub fn enter(&self, unit: UnitId, target: &HostValue, args: &[HostValue]) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.call_stack.push(unit);
        }
        self.event(|timestamp, cx| Message::Enter {
            timestamp,
            unit,
            target: cx.value(target),
            args: cx.values(args),
        });
    }

    pub fn exit(&self, unit: UnitId, probe: ProbeId, result: &HostValue) {
        self.pop_unit();
        self.event(|timestamp, cx| Message::Exit {
            timestamp,
            unit,
            probe,
            result: cx.value(result),
        });
    }

    pub fn exit_with_error(&self, unit: UnitId, probe: ProbeId, error: &HostValue) {
        self.pop_unit();
        self.event(|timestamp, cx| Message::ExitWithError {
            timestamp,
            unit,
            probe,
            error: cx.value(error),
        });
    }

    fn pop_unit(&self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.call_stack.pop();
        }
    }

    pub fn field_write(&self, probe: ProbeId, field: FieldId, target: &HostValue, value: &HostValue) {
        self.event(|timestamp, cx| Message::FieldWrite {
            timestamp,
            probe,
            field,
            target: cx.value(target),
            value: cx.value(value),
        });
    }

    pub fn array_write(&self, probe: ProbeId, target: &HostValue, index: i32, value: &HostValue) {
        self.event(|timestamp, cx| Message::ArrayWrite {
            timestamp,
            probe,
            target: cx.value(target),
            index,
            value: cx.value(value),
        });
    }

    pub fn local_write(&self, probe: ProbeId, slot: u32, value: &HostValue) {
        self.event(|timestamp, cx| Message::LocalWrite {
            timestamp,
            probe,
            slot,
            value: cx.value(value),
        });
    }

    pub fn new_array(&self, probe: ProbeId, target: &HostValue, base_type: TypeId, size: i32) {
        self.event(|timestamp, cx| Message::NewArray {
            timestamp,
            probe,
            target: cx.value(target),
            base_type,
            size,
        });
    }

    pub fn type_check(&self, probe: ProbeId, value: &HostValue, type_id: TypeId, result: bool) {
        self.event(|timestamp, cx| Message::TypeCheck {
            timestamp,
            probe,
            value: cx.value(value),
            type_id,
            result,
        });
    }

    pub fn before_call_dry(&self, probe: ProbeId, unit: UnitId, advice: Option<AdviceId>) {
        self.event(|timestamp, _| Message::BeforeCallDry {
            timestamp,
            probe,
            unit,
            advice: advice.unwrap_or(AdviceId::NONE),
        });
    }

    pub fn after_call_dry(&self, probe: ProbeId) {
        self.event(|timestamp, _| Message::AfterCallDry { timestamp, probe });
    }

    pub fn before_call(&self, probe: ProbeId, unit: UnitId, target: &HostValue, args: &[HostValue]) {
        self.event(|timestamp, cx| Message::BeforeCall {
            timestamp,
            probe,
            unit,
            target: cx.value(target),
            args: cx.values(args),
        });
    }

    pub fn after_call(&self, probe: ProbeId, unit: UnitId, target: &HostValue, result: &HostValue) {
        self.event(|timestamp, cx| Message::AfterCall {
            timestamp,
            probe,
            unit,
            target: cx.value(target),
            result: cx.value(result),
        });
    }

    pub fn after_call_with_error(
        &self,
        probe: ProbeId,
        unit: UnitId,
        target: &HostValue,
        error: &HostValue,
    ) {
        self.event(|timestamp, cx| Message::AfterCallWithError {
            timestamp,
            probe,
            unit,
            target: cx.value(target),
            error: cx.value(error),
        });
    }

    pub fn output(&self, stream: OutputStream, text: &str) {
        self.event(|timestamp, _| Message::Output {
            timestamp,
            stream,
            text: text.to_owned(),
        });
    }

    pub fn exception(&self, unit: UnitId, probe: ProbeId, error: &HostValue) {
        self.event(|timestamp, cx| Message::Exception {
            timestamp,
            unit,
            probe,
            error: cx.value(error),
        });
    }

    /// Hands the packet under construction to the sink, even if not full.
    pub fn flush(&self) {
        if let Some(mut guard) = self.begin() {
            guard.flush();
        }
    }
}

impl Drop for ThreadChannel {
    fn drop(&mut self) {
        self.flush();
        let state = self.state.get_mut();
        if !state.pending.is_empty() {
            log::warn!("{} closed with {} unsent registrations", self.producer, state.pending.len());
        }
        let packet = mem::take(&mut state.packet);
        self.shared.pool.put(packet);
    }
}

impl<'a> EventGuard<'a> {
    fn build<F>(&mut self, f: F) -> Message
    where
        F: FnOnce(u64, &mut Converter<'_>) -> Message,
    {
        let shared = &self.channel.shared;
        let state = &mut *self.state;
        let timestamp = state.clock.next(&shared.clock, shared.config.max_same_tick);
        let mut cx = Converter::new(&shared.registry, timestamp, &state.carried, &mut state.pending);
        f(timestamp, &mut cx)
    }

    /// Serializes pending registrations, then the message itself. The packet
    /// goes to the sink when full or when the agent asked for a flush.
    fn finish(mut self, msg: Message) {
        self.register_pending();
        let channel = self.channel;
        let shared = &channel.shared;
        let state = &mut *self.state;
        msg.encode(&mut state.packet, &mut state.ids);
        let config = &shared.config;
        let requested = state.flush_epoch != shared.flush_epoch.load(Ordering::Relaxed);
        if requested || buffer::is_full(&state.packet, config.packet_size, config.max_message_size) {
            self.flush();
        }
    }

    fn register_pending(&mut self) {
        if self.state.pending.is_empty() {
            return;
        }
        let channel = self.channel;
        if channel.converting.replace(true) {
            fatal(format_args!("{} recursive value registration", channel.producer));
        }
        let shared = &channel.shared;
        let state = &mut *self.state;
        // an object discovered while building a registration is built later
        // and must be written earlier, hence the reversal
        let mut registrations = vec![];
        while let Some(Pending { id, object }) = state.pending.pop() {
            state.carried.insert(object.key());
            let msg = if object.by_value() {
                let mut cx = Converter::new(
                    &shared.registry,
                    state.clock.last(),
                    &state.carried,
                    &mut state.pending,
                );
                Message::RegisterObject {
                    id,
                    graph: cx.graph(&object),
                }
            } else {
                let timestamp = shared
                    .registry
                    .first_seen(object.key())
                    .unwrap_or_else(|| state.clock.last());
                Message::RegisterRefObject {
                    id,
                    type_id: object.type_id(),
                    timestamp,
                }
            };
            registrations.push(msg);
        }
        for msg in registrations.into_iter().rev() {
            msg.encode(&mut state.packet, &mut state.ids);
        }
        channel.converting.set(false);
    }

    fn flush(&mut self) {
        let channel = self.channel;
        let shared = &channel.shared;
        let state = &mut *self.state;
        state.flush_epoch = shared.flush_epoch.load(Ordering::Relaxed);
        if state.packet.is_empty() {
            return;
        }
        let packet = mem::replace(&mut state.packet, shared.pool.take());
        shared.send(channel.producer, packet);
        for key in mem::take(&mut state.carried) {
            shared.registry.mark_sent(key);
        }
    }
}
