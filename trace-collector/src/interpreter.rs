use serde::Serialize;
use trace_wire::{
    AdviceId, FieldId, Message, OutputStream, ProbeId, ProducerId, TypeId, UnitId, Value,
};

/// One reconstructed event. `parent_timestamp` is the timestamp of the
/// call enclosing the event, `0` at the top of the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub producer: ProducerId,
    pub timestamp: u64,
    pub parent_timestamp: u64,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<AdviceId>,
    /// Made up to repair the stream, not observed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "kind")]
pub enum EventKind {
    Call {
        unit: UnitId,
        probe: ProbeId,
        target: Value,
        args: Vec<Value>,
        /// Not preceded by a call site, a side effect of the caller.
        direct_parent: bool,
        /// The callee ran opaque, only its boundary is known.
        dry: bool,
    },
    Exit {
        unit: UnitId,
        probe: ProbeId,
        result: Value,
    },
    ExitWithError {
        unit: UnitId,
        probe: ProbeId,
        error: Value,
    },
    FieldWrite {
        probe: ProbeId,
        field: FieldId,
        target: Value,
        value: Value,
    },
    ArrayWrite {
        probe: ProbeId,
        target: Value,
        index: i32,
        value: Value,
    },
    LocalWrite {
        probe: ProbeId,
        slot: u32,
        value: Value,
    },
    NewArray {
        probe: ProbeId,
        target: Value,
        base_type: TypeId,
        size: i32,
    },
    TypeCheck {
        probe: ProbeId,
        value: Value,
        type_id: TypeId,
        result: bool,
    },
    Output {
        stream: OutputStream,
        text: String,
    },
    Exception {
        unit: UnitId,
        probe: ProbeId,
        error: Value,
    },
}

impl EventKind {
    pub fn is_call(&self) -> bool {
        matches!(self, EventKind::Call { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, EventKind::Exit { .. } | EventKind::ExitWithError { .. })
    }
}

#[derive(Debug, Clone)]
enum PendingCall {
    Dry,
    Full { target: Value, args: Vec<Value> },
}

#[derive(Debug, Clone)]
struct Frame {
    // opened by a call site, the enter of the callee has not arrived
    entering: bool,
    unit: UnitId,
    direct_parent: bool,
    parent_timestamp: u64,
    timestamp: u64,
    call: Option<PendingCall>,
    probe: ProbeId,
    advice: Option<AdviceId>,
    // a call made from this frame was closed by the exit of its callee,
    // the after call is still to come
    returned: bool,
}

impl Frame {
    fn root() -> Self {
        Frame {
            entering: false,
            unit: UnitId::NONE,
            direct_parent: false,
            parent_timestamp: 0,
            timestamp: 0,
            call: None,
            probe: ProbeId::NONE,
            advice: None,
            returned: false,
        }
    }

    fn is_implicit(&self) -> bool {
        self.direct_parent && !self.entering
    }
}

enum CallEnd {
    Return(Value),
    Error(Value),
}

/// Rebuilds the call tree of one producer thread from its messages.
pub struct EventInterpreter {
    producer: ProducerId,
    // frames[0] is the root of the thread, never popped
    frames: Vec<Frame>,
    advice: Vec<AdviceId>,
    // open implicit frames, they do not add to the reported depth
    implicit: u32,
    last_timestamp: u64,
    events: u64,
    repairs: u64,
}

impl EventInterpreter {
    pub fn new(producer: ProducerId) -> Self {
        EventInterpreter {
            producer,
            frames: vec![Frame::root()],
            advice: vec![],
            implicit: 0,
            last_timestamp: 0,
            events: 0,
            repairs: 0,
        }
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    /// Open frames above the root that were opened by a call site. This is
    /// the depth events are reported at, implicit frames are not counted.
    pub fn depth(&self) -> u32 {
        self.open() - self.implicit
    }

    /// Open frames not opened by a call site.
    pub fn implicit_depth(&self) -> u32 {
        self.implicit
    }

    fn open(&self) -> u32 {
        (self.frames.len() - 1) as u32
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn repairs(&self) -> u64 {
        self.repairs
    }

    fn top(&self) -> &Frame {
        self.frames.last().unwrap_or_else(|| unreachable!("root frame is never popped"))
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .unwrap_or_else(|| unreachable!("root frame is never popped"))
    }

    fn emit(&mut self, out: &mut Vec<TraceEvent>, event: Event) {
        self.events += 1;
        out.push(TraceEvent {
            producer: self.producer,
            timestamp: event.timestamp,
            parent_timestamp: event.parent_timestamp,
            depth: event.depth,
            advice: self.advice.last().copied(),
            synthetic: event.synthetic,
            kind: event.kind,
        });
    }

    fn body(&mut self, out: &mut Vec<TraceEvent>, timestamp: u64, kind: EventKind) {
        let event = Event {
            timestamp,
            parent_timestamp: self.top().timestamp,
            depth: self.depth(),
            synthetic: false,
            kind,
        };
        self.emit(out, event);
    }

    /// Interprets one message, registrations and commands are ignored.
    pub fn on_message(&mut self, msg: &Message, out: &mut Vec<TraceEvent>) {
        if let Some(timestamp) = msg.timestamp() {
            self.last_timestamp = self.last_timestamp.max(timestamp);
        }
        match msg.clone() {
            Message::BeforeCallDry {
                timestamp,
                probe,
                unit,
                advice,
            } => self.before_call(timestamp, probe, unit, PendingCall::Dry, advice.get()),
            Message::BeforeCall {
                timestamp,
                probe,
                unit,
                target,
                args,
            } => self.before_call(
                timestamp,
                probe,
                unit,
                PendingCall::Full { target, args },
                None,
            ),
            Message::Enter {
                timestamp,
                unit,
                target,
                args,
            } => self.enter(out, timestamp, unit, target, args),
            Message::Exit {
                timestamp,
                unit,
                probe,
                result,
            } => self.exit(out, timestamp, unit, probe, CallEnd::Return(result)),
            Message::ExitWithError {
                timestamp,
                unit,
                probe,
                error,
            } => self.exit(out, timestamp, unit, probe, CallEnd::Error(error)),
            Message::AfterCallDry { timestamp, probe } => self.after_call(
                out,
                timestamp,
                probe,
                UnitId::NONE,
                Value::Null,
                CallEnd::Return(Value::Null),
            ),
            Message::AfterCall {
                timestamp,
                probe,
                unit,
                target,
                result,
            } => self.after_call(out, timestamp, probe, unit, target, CallEnd::Return(result)),
            Message::AfterCallWithError {
                timestamp,
                probe,
                unit,
                target,
                error,
            } => self.after_call(out, timestamp, probe, unit, target, CallEnd::Error(error)),
            Message::FieldWrite {
                timestamp,
                probe,
                field,
                target,
                value,
            } => self.body(
                out,
                timestamp,
                EventKind::FieldWrite {
                    probe,
                    field,
                    target,
                    value,
                },
            ),
            Message::ArrayWrite {
                timestamp,
                probe,
                target,
                index,
                value,
            } => self.body(
                out,
                timestamp,
                EventKind::ArrayWrite {
                    probe,
                    target,
                    index,
                    value,
                },
            ),
            Message::LocalWrite {
                timestamp,
                probe,
                slot,
                value,
            } => self.body(out, timestamp, EventKind::LocalWrite { probe, slot, value }),
            Message::NewArray {
                timestamp,
                probe,
                target,
                base_type,
                size,
            } => self.body(
                out,
                timestamp,
                EventKind::NewArray {
                    probe,
                    target,
                    base_type,
                    size,
                },
            ),
            Message::TypeCheck {
                timestamp,
                probe,
                value,
                type_id,
                result,
            } => self.body(
                out,
                timestamp,
                EventKind::TypeCheck {
                    probe,
                    value,
                    type_id,
                    result,
                },
            ),
            Message::Output {
                timestamp,
                stream,
                text,
            } => self.body(out, timestamp, EventKind::Output { stream, text }),
            Message::Exception {
                timestamp,
                unit,
                probe,
                error,
            } => self.body(out, timestamp, EventKind::Exception { unit, probe, error }),
            Message::RegisterObject { .. }
            | Message::RegisterRefObject { .. }
            | Message::RegisterType { .. }
            | Message::RegisterLoader { .. }
            | Message::RegisterThread { .. }
            | Message::Command(_) => (),
        }
    }

    fn before_call(
        &mut self,
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        call: PendingCall,
        advice: Option<AdviceId>,
    ) {
        let top = self.top_mut();
        top.returned = false;
        let parent_timestamp = top.timestamp;
        self.frames.push(Frame {
            entering: true,
            unit,
            direct_parent: false,
            parent_timestamp,
            timestamp,
            call: Some(call),
            probe,
            advice,
            returned: false,
        });
        if let Some(advice) = advice {
            self.advice.push(advice);
        }
    }

    fn enter(
        &mut self,
        out: &mut Vec<TraceEvent>,
        timestamp: u64,
        unit: UnitId,
        target: Value,
        args: Vec<Value>,
    ) {
        let (open, depth) = (self.open(), self.depth());
        let top = self.top_mut();
        if open > 0 && top.entering {
            top.entering = false;
            top.unit = unit;
            let event = Event {
                timestamp: top.timestamp,
                parent_timestamp: top.parent_timestamp,
                depth,
                synthetic: false,
                kind: EventKind::Call {
                    unit,
                    probe: top.probe,
                    target,
                    args,
                    direct_parent: false,
                    dry: matches!(top.call, Some(PendingCall::Dry)),
                },
            };
            self.emit(out, event);
            return;
        }

        let parent_timestamp = top.timestamp;
        self.frames.push(Frame {
            entering: false,
            unit,
            direct_parent: true,
            parent_timestamp,
            timestamp,
            call: None,
            probe: ProbeId::NONE,
            advice: None,
            returned: false,
        });
        self.implicit += 1;
        let event = Event {
            timestamp,
            parent_timestamp,
            depth: self.depth(),
            synthetic: false,
            kind: EventKind::Call {
                unit,
                probe: ProbeId::NONE,
                target,
                args,
                direct_parent: true,
                dry: false,
            },
        };
        self.emit(out, event);
    }

    fn exit(
        &mut self,
        out: &mut Vec<TraceEvent>,
        timestamp: u64,
        unit: UnitId,
        probe: ProbeId,
        end: CallEnd,
    ) {
        while self.open() > 0 && self.top().entering {
            log::warn!(
                "{} exit of {unit} while a call to {} is entering",
                self.producer,
                self.top().unit
            );
            self.repairs += 1;
            self.envelope(out, timestamp, ProbeId::NONE, CallEnd::Return(Value::Null), true);
        }

        if self.open() == 0 {
            log::warn!("{} exit of {unit} without a frame", self.producer);
            self.repairs += 1;
            let event = Event {
                timestamp,
                parent_timestamp: 0,
                depth: 1,
                synthetic: true,
                kind: exit_kind(unit, probe, end),
            };
            self.emit(out, event);
            return;
        }

        let depth = self.depth();
        let frame = self.pop();
        if frame.unit != unit {
            log::debug!("{} exit of {unit} closes {}", self.producer, frame.unit);
        }
        let event = Event {
            timestamp,
            parent_timestamp: frame.parent_timestamp,
            depth,
            synthetic: false,
            kind: exit_kind(unit, probe, end),
        };
        self.emit(out, event);
        if frame.call.is_some() {
            self.top_mut().returned = true;
        }
    }

    fn after_call(
        &mut self,
        out: &mut Vec<TraceEvent>,
        timestamp: u64,
        probe: ProbeId,
        unit: UnitId,
        target: Value,
        end: CallEnd,
    ) {
        if self.top().returned {
            self.top_mut().returned = false;
            return;
        }
        if self.open() > 0 && self.top().entering {
            self.envelope(out, timestamp, probe, end, false);
            return;
        }

        log::warn!(
            "{} after call of {unit} at {timestamp} does not match the stack",
            self.producer
        );
        self.repairs += 1;
        while self.open() > 0 && self.top().is_implicit() {
            let depth = self.depth();
            let frame = self.pop();
            let event = Event {
                timestamp,
                parent_timestamp: frame.parent_timestamp,
                depth,
                synthetic: true,
                kind: exit_kind(frame.unit, ProbeId::NONE, CallEnd::Return(Value::Null)),
            };
            self.emit(out, event);
        }
        // the call site under the implicit frames has returned already
        if self.top().returned {
            self.top_mut().returned = false;
            return;
        }
        if self.open() > 0 && self.top().entering {
            self.envelope(out, timestamp, probe, end, false);
            return;
        }

        let parent_timestamp = self.top().timestamp;
        let depth = self.depth() + 1;
        let call = Event {
            timestamp,
            parent_timestamp,
            depth,
            synthetic: true,
            kind: EventKind::Call {
                unit,
                probe,
                target,
                args: vec![],
                direct_parent: false,
                dry: unit == UnitId::NONE,
            },
        };
        self.emit(out, call);
        let exit = Event {
            timestamp,
            parent_timestamp,
            depth,
            synthetic: true,
            kind: exit_kind(unit, probe, end),
        };
        self.emit(out, exit);
    }

    /// Call and exit of an entering frame whose callee never entered.
    fn envelope(
        &mut self,
        out: &mut Vec<TraceEvent>,
        timestamp: u64,
        probe: ProbeId,
        end: CallEnd,
        synthetic: bool,
    ) {
        let depth = self.depth();
        let frame = self.pop();
        let (target, args, dry) = match frame.call {
            Some(PendingCall::Full { target, args }) => (target, args, false),
            Some(PendingCall::Dry) | None => (Value::Null, vec![], true),
        };
        // the advice of the frame is already popped, it is still the context of the pair
        if let Some(advice) = frame.advice {
            self.advice.push(advice);
        }
        let call = Event {
            timestamp: frame.timestamp,
            parent_timestamp: frame.parent_timestamp,
            depth,
            synthetic,
            kind: EventKind::Call {
                unit: frame.unit,
                probe: frame.probe,
                target,
                args,
                direct_parent: false,
                dry,
            },
        };
        self.emit(out, call);
        let exit = Event {
            timestamp,
            parent_timestamp: frame.parent_timestamp,
            depth,
            synthetic,
            kind: exit_kind(frame.unit, probe, end),
        };
        self.emit(out, exit);
        if frame.advice.is_some() {
            self.advice.pop();
        }
    }

    fn pop(&mut self) -> Frame {
        if self.frames.len() <= 1 {
            return Frame::root();
        }
        let frame = self.frames.pop().unwrap_or_else(Frame::root);
        if frame.advice.is_some() {
            self.advice.pop();
        }
        if frame.is_implicit() {
            self.implicit = self.implicit.saturating_sub(1);
        }
        frame
    }

    /// End of the stream, closes every open frame with a synthetic exit.
    /// Returns the number of frames closed.
    pub fn finish(&mut self, out: &mut Vec<TraceEvent>) -> u32 {
        let open = self.open();
        let timestamp = self.last_timestamp;
        while self.open() > 0 {
            if self.top().entering {
                self.envelope(out, timestamp, ProbeId::NONE, CallEnd::Return(Value::Null), true);
                continue;
            }
            let depth = self.depth();
            let frame = self.pop();
            let event = Event {
                timestamp,
                parent_timestamp: frame.parent_timestamp,
                depth,
                synthetic: true,
                kind: exit_kind(frame.unit, ProbeId::NONE, CallEnd::Return(Value::Null)),
            };
            self.emit(out, event);
        }
        self.top_mut().returned = false;
        if open > 0 {
            log::warn!("{} ends with {open} open frames", self.producer);
            self.repairs += u64::from(open);
        }
        open
    }
}

struct Event {
    timestamp: u64,
    parent_timestamp: u64,
    depth: u32,
    synthetic: bool,
    kind: EventKind,
}

fn exit_kind(unit: UnitId, probe: ProbeId, end: CallEnd) -> EventKind {
    match end {
        CallEnd::Return(result) => EventKind::Exit {
            unit,
            probe,
            result,
        },
        CallEnd::Error(error) => EventKind::ExitWithError { unit, probe, error },
    }
}

#[cfg(test)]
mod tests;
