use trace_wire::{
    metapacket, Command, IdDelta, LoaderId, Message, ObjectId, ProbeId, ProducerId, TypeId,
    UnitId, Value,
};

use super::{Cx, Session, SessionError};
use crate::{
    catalog::{HasTrace, StructureCatalog, TypeDef, UnitDef},
    interpreter::EventKind,
    store::{MemoryStore, Record},
    transport::TransportError,
};

struct Harness {
    session: Session,
    catalog: StructureCatalog,
    store: MemoryStore,
    sink: MemoryStore,
    ids: std::collections::BTreeMap<ProducerId, IdDelta>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::default();
        let mut harness = Harness {
            session: Session::new(1, "test", 1 << 20),
            catalog: StructureCatalog::default(),
            sink: store.clone(),
            store,
            ids: Default::default(),
        };
        let mut cx = Cx {
            catalog: &mut harness.catalog,
            store: &mut harness.sink,
        };
        harness.session.start(&mut cx).unwrap();
        harness
    }

    fn send(&mut self, producer: u32, messages: &[Message]) -> Result<(), SessionError> {
        let producer = ProducerId(producer);
        let ids = self.ids.entry(producer).or_default();
        let mut packet = vec![];
        for msg in messages {
            msg.encode(&mut packet, ids);
        }
        let mut bytes = vec![];
        metapacket::write_packet(&mut bytes, producer, &packet, 7).unwrap();
        self.raw(&bytes)
    }

    fn raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut cx = Cx {
            catalog: &mut self.catalog,
            store: &mut self.sink,
        };
        self.session.on_data(bytes, &mut cx)
    }

    fn finish(&mut self) -> super::SessionStats {
        let mut cx = Cx {
            catalog: &mut self.catalog,
            store: &mut self.sink,
        };
        self.session.finish(&mut cx).unwrap()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.store
            .records()
            .iter()
            .map(|r| match r {
                Record::SessionStart { .. } => "start",
                Record::Event { .. } => "event",
                Record::Registration { .. } => "registration",
                Record::Capture { .. } => "capture",
                Record::Clear { .. } => "clear",
                Record::SessionEnd { .. } => "end",
            })
            .collect()
    }
}

fn thread(name: &str) -> Message {
    Message::RegisterThread {
        host_id: 1,
        name: name.to_owned(),
    }
}

fn reference(id: u64, type_id: u32) -> Message {
    Message::RegisterRefObject {
        id: ObjectId(id),
        type_id: TypeId(type_id),
        timestamp: 1,
    }
}

fn enter(timestamp: u64, unit: u32, target: Value) -> Message {
    Message::Enter {
        timestamp,
        unit: UnitId(unit),
        target,
        args: vec![],
    }
}

fn exit(timestamp: u64, unit: u32) -> Message {
    Message::Exit {
        timestamp,
        unit: UnitId(unit),
        probe: ProbeId(0),
        result: Value::Int(1),
    }
}

#[test]
fn registrations_then_events() {
    let mut h = Harness::new();
    h.send(
        1,
        &[
            thread("main"),
            reference(3, 2),
            enter(2, 5, Value::Object(ObjectId(3))),
            exit(3, 5),
        ],
    )
    .unwrap();
    h.send(0, &[Message::Command(Command::End)]).unwrap();
    assert!(h.session.is_ended());

    let stats = h.finish();
    assert_eq!(
        h.kinds(),
        ["start", "registration", "registration", "event", "event", "end"]
    );
    assert_eq!(stats.messages, 5);
    assert_eq!(stats.registrations, 2);
    assert_eq!(stats.events, 2);
    assert_eq!(stats.repairs, 0);
    assert_eq!(stats.producers, 2);
    assert!(stats.metapackets > stats.packets);
    assert_eq!(stats.packets, 2);
}

#[test]
fn identical_registration_is_tolerated() {
    let mut h = Harness::new();
    h.send(1, &[thread("main"), reference(3, 2)]).unwrap();
    h.send(1, &[thread("main"), reference(3, 2)]).unwrap();
    assert_eq!(h.session.stats().registrations, 2);
    // another thread carrying the same object registration
    h.send(2, &[thread("worker"), reference(3, 2)]).unwrap();
    assert_eq!(h.session.stats().registrations, 3);

    let conflict = h.send(1, &[reference(3, 4)]);
    assert!(matches!(
        conflict,
        Err(SessionError::Conflict { what: "object", .. })
    ));
}

#[test]
fn type_conflicts_with_catalog() {
    let mut h = Harness::new();
    let id = h
        .catalog
        .define_type(&TypeDef {
            name: "app.A".to_owned(),
            ..TypeDef::default()
        })
        .unwrap();
    let good = Message::RegisterType {
        id,
        loader: LoaderId::NONE,
        name: "app.A".to_owned(),
    };
    h.send(1, &[good]).unwrap();
    let bad = Message::RegisterType {
        id,
        loader: LoaderId::NONE,
        name: "app.B".to_owned(),
    };
    assert!(matches!(
        h.send(2, &[bad]),
        Err(SessionError::Conflict { what: "type", .. })
    ));
}

#[test]
fn clear_and_capture() {
    let mut h = Harness::new();
    h.send(1, &[enter(1, 5, Value::Null), exit(2, 5)]).unwrap();
    h.send(
        0,
        &[
            Message::Command(Command::Clear),
            Message::Command(Command::CaptureEnabled(false)),
        ],
    )
    .unwrap();
    assert_eq!(h.kinds(), ["clear", "capture"]);
}

#[test]
fn decode_error() {
    let mut h = Harness::new();
    let mut bytes = vec![];
    metapacket::write_packet(&mut bytes, ProducerId(1), &[0x63, 0, 0], 64).unwrap();
    assert!(matches!(
        h.raw(&bytes),
        Err(SessionError::Transport(TransportError::Decode {
            position: 0,
            ..
        }))
    ));
}

#[test]
fn finish_closes_open_calls() {
    let mut h = Harness::new();
    let unit = UnitDef {
        name: "m".to_owned(),
        signature: "()V".to_owned(),
        ..UnitDef::default()
    };
    let a = h
        .catalog
        .define_type(&TypeDef {
            name: "app.A".to_owned(),
            units: vec![unit],
            ..TypeDef::default()
        })
        .unwrap();
    let m = h.catalog.unit_by_name(a, "m", "()V").unwrap().id;

    h.send(1, &[enter(4, m.0, Value::Null)]).unwrap();
    assert_eq!(h.catalog.unit(m).unwrap().has_trace, HasTrace::Yes);

    let stats = h.finish();
    assert_eq!(stats.repairs, 1);
    let events = h.store.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].synthetic);
    assert!(matches!(events[1].kind, EventKind::Exit { unit, .. } if unit == m));
    assert_eq!(events[1].timestamp, 4);
}

#[test]
fn truncated_stream() {
    let mut h = Harness::new();
    h.raw(&[0, 0, 0, 1, 0]).unwrap();
    let mut cx = Cx {
        catalog: &mut h.catalog,
        store: &mut h.sink,
    };
    assert!(matches!(
        h.session.finish(&mut cx),
        Err(SessionError::Transport(TransportError::Truncated(5)))
    ));
    assert_eq!(h.kinds().last(), Some(&"end"));
}
