use proptest::prelude::*;
use trace_wire::{AdviceId, FieldId, Message, ProbeId, ProducerId, UnitId, Value};

use super::{EventInterpreter, EventKind, TraceEvent};

fn run(messages: &[Message]) -> (EventInterpreter, Vec<TraceEvent>) {
    let mut interpreter = EventInterpreter::new(ProducerId(1));
    let mut out = vec![];
    for msg in messages {
        interpreter.on_message(msg, &mut out);
    }
    (interpreter, out)
}

fn dry(timestamp: u64, unit: u32, advice: u32) -> Message {
    Message::BeforeCallDry {
        timestamp,
        probe: ProbeId(unit),
        unit: UnitId(unit),
        advice: AdviceId(advice),
    }
}

fn after_dry(timestamp: u64) -> Message {
    Message::AfterCallDry {
        timestamp,
        probe: ProbeId(100),
    }
}

fn enter(timestamp: u64, unit: u32) -> Message {
    Message::Enter {
        timestamp,
        unit: UnitId(unit),
        target: Value::Null,
        args: vec![Value::Int(unit as i32)],
    }
}

fn exit(timestamp: u64, unit: u32) -> Message {
    Message::Exit {
        timestamp,
        unit: UnitId(unit),
        probe: ProbeId(0),
        result: Value::Null,
    }
}

// (kind, unit, depth, parent timestamp, synthetic)
fn shape(events: &[TraceEvent]) -> Vec<(&'static str, u32, u32, u64, bool)> {
    events
        .iter()
        .map(|e| {
            let (kind, unit) = match &e.kind {
                EventKind::Call { unit, .. } => ("call", unit.0),
                EventKind::Exit { unit, .. } => ("exit", unit.0),
                EventKind::ExitWithError { unit, .. } => ("error", unit.0),
                _ => ("body", 0),
            };
            (kind, unit, e.depth, e.parent_timestamp, e.synthetic)
        })
        .collect()
}

#[test]
fn nested_dry_calls() {
    let (interpreter, events) = run(&[dry(1, 1, 0), dry(2, 2, 0), after_dry(3), after_dry(4)]);
    assert_eq!(
        shape(&events),
        [
            ("call", 2, 2, 1, false),
            ("exit", 2, 2, 1, false),
            ("call", 1, 1, 0, false),
            ("exit", 1, 1, 0, false),
        ]
    );
    assert_eq!(events[0].timestamp, 2);
    assert_eq!(events[1].timestamp, 3);
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.repairs(), 0);
    assert!(matches!(events[0].kind, EventKind::Call { dry: true, .. }));
}

#[test]
fn full_call() {
    let before = Message::BeforeCall {
        timestamp: 1,
        probe: ProbeId(7),
        unit: UnitId(5),
        target: Value::Null,
        args: vec![],
    };
    let write = Message::FieldWrite {
        timestamp: 3,
        probe: ProbeId(8),
        field: FieldId(1),
        target: Value::Null,
        value: Value::Int(1),
    };
    let after = Message::AfterCall {
        timestamp: 5,
        probe: ProbeId(7),
        unit: UnitId(5),
        target: Value::Null,
        result: Value::Int(2),
    };
    // the callee resolves to an override
    let (interpreter, events) = run(&[before, enter(2, 6), write, exit(4, 6), after]);
    assert_eq!(
        shape(&events),
        [
            ("call", 6, 1, 0, false),
            ("body", 0, 1, 1, false),
            ("exit", 6, 1, 0, false),
        ]
    );
    assert_eq!(events[0].timestamp, 1);
    assert!(matches!(
        &events[0].kind,
        EventKind::Call { probe: ProbeId(7), args, dry: false, .. } if args == &[Value::Int(6)]
    ));
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.repairs(), 0);
}

#[test]
fn full_call_without_enter() {
    let before = Message::BeforeCall {
        timestamp: 1,
        probe: ProbeId(7),
        unit: UnitId(5),
        target: Value::Int(9),
        args: vec![Value::Int(1)],
    };
    let after = Message::AfterCallWithError {
        timestamp: 2,
        probe: ProbeId(7),
        unit: UnitId(5),
        target: Value::Int(9),
        error: Value::Int(3),
    };
    let (interpreter, events) = run(&[before, after]);
    assert_eq!(
        shape(&events),
        [("call", 5, 1, 0, false), ("error", 5, 1, 0, false)]
    );
    assert!(matches!(
        &events[0].kind,
        EventKind::Call { target: Value::Int(9), dry: false, .. }
    ));
    assert_eq!(interpreter.repairs(), 0);
}

#[test]
fn implicit_call() {
    let (interpreter, events) = run(&[enter(1, 1), enter(2, 2), exit(3, 2), exit(4, 1)]);
    assert_eq!(
        shape(&events),
        [
            ("call", 1, 0, 0, false),
            ("call", 2, 0, 1, false),
            ("exit", 2, 0, 1, false),
            ("exit", 1, 0, 0, false),
        ]
    );
    assert!(matches!(events[1].kind, EventKind::Call { direct_parent: true, .. }));
    assert_eq!(interpreter.implicit_depth(), 0);
    assert_eq!(interpreter.repairs(), 0);
}

#[test]
fn implicit_frames_keep_depth() {
    let write = Message::LocalWrite {
        timestamp: 2,
        probe: ProbeId(1),
        slot: 0,
        value: Value::Int(0),
    };
    let (interpreter, events) = run(&[dry(1, 1, 0), enter(2, 1), enter(3, 9), write.clone()]);
    assert_eq!(interpreter.depth(), 1);
    assert_eq!(interpreter.implicit_depth(), 1);
    // the write inside the implicit frame is as deep as the dry call around it
    assert_eq!(
        shape(&events),
        [
            ("call", 1, 1, 0, false),
            ("call", 9, 1, 1, false),
            ("body", 0, 1, 3, false),
        ]
    );

    let (interpreter, events) = run(&[enter(1, 9), write, dry(3, 2, 0), after_dry(4), exit(5, 9)]);
    assert_eq!(
        shape(&events),
        [
            ("call", 9, 0, 0, false),
            ("body", 0, 0, 1, false),
            ("call", 2, 1, 1, false),
            ("exit", 2, 1, 1, false),
            ("exit", 9, 0, 0, false),
        ]
    );
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.repairs(), 0);
}

#[test]
fn implicit_call_between_exit_and_after_call() {
    let (interpreter, events) = run(&[
        dry(1, 1, 0),
        enter(2, 1),
        exit(3, 1),
        enter(4, 9),
        dry(5, 2, 0),
        after_dry(6),
        exit(7, 9),
        after_dry(8),
    ]);
    assert_eq!(
        shape(&events),
        [
            ("call", 1, 1, 0, false),
            ("exit", 1, 1, 0, false),
            ("call", 9, 0, 0, false),
            ("call", 2, 1, 4, false),
            ("exit", 2, 1, 4, false),
            ("exit", 9, 0, 0, false),
        ]
    );
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.implicit_depth(), 0);
    assert_eq!(interpreter.repairs(), 0);
}

#[test]
fn unmatched_after_call() {
    let (interpreter, events) = run(&[after_dry(1)]);
    assert_eq!(
        shape(&events),
        [("call", 0, 1, 0, true), ("exit", 0, 1, 0, true)]
    );
    assert_eq!(interpreter.repairs(), 1);
}

#[test]
fn after_call_unwinds_implicit_frames() {
    let (interpreter, events) = run(&[dry(1, 1, 0), enter(2, 2), exit(3, 2), enter(4, 3), after_dry(5)]);
    // the enter completes the dry call and its exit marks it returned, the
    // second enter is implicit and never exits before the after call
    assert_eq!(
        shape(&events),
        [
            ("call", 2, 1, 0, false),
            ("exit", 2, 1, 0, false),
            ("call", 3, 0, 0, false),
            ("exit", 3, 0, 0, true),
        ]
    );
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.implicit_depth(), 0);
    assert_eq!(interpreter.repairs(), 1);

    let (interpreter, events) = run(&[dry(1, 1, 0), after_dry(2), enter(3, 3), after_dry(4)]);
    assert_eq!(
        shape(&events),
        [
            ("call", 1, 1, 0, false),
            ("exit", 1, 1, 0, false),
            ("call", 3, 0, 0, false),
            ("exit", 3, 0, 0, true),
            ("call", 0, 1, 0, true),
            ("exit", 0, 1, 0, true),
        ]
    );
    assert_eq!(interpreter.depth(), 0);
    assert_eq!(interpreter.implicit_depth(), 0);
    assert_eq!(interpreter.repairs(), 1);
}

#[test]
fn exit_without_frame() {
    let (interpreter, events) = run(&[exit(1, 4)]);
    assert_eq!(shape(&events), [("exit", 4, 1, 0, true)]);
    assert_eq!(interpreter.repairs(), 1);
}

#[test]
fn advice_context() {
    let (interpreter, events) = run(&[dry(1, 1, 9), dry(2, 2, 0), after_dry(3), after_dry(4), dry(5, 3, 0), after_dry(6)]);
    let advice = events.iter().map(|e| e.advice).collect::<Vec<_>>();
    let a = Some(AdviceId(9));
    assert_eq!(advice, [a, a, a, a, None, None]);
    assert_eq!(interpreter.depth(), 0);
}

#[test]
fn finish_closes_frames() {
    let (mut interpreter, _) = run(&[enter(1, 1), dry(2, 2, 0), enter(3, 3)]);
    let mut out = vec![];
    // the second enter completes the dry call
    assert_eq!(interpreter.finish(&mut out), 2);
    assert_eq!(
        shape(&out),
        [("exit", 3, 1, 1, true), ("exit", 1, 0, 0, true)]
    );
    assert_eq!(interpreter.depth(), 0);
}

#[derive(Debug, Clone)]
enum Node {
    // the last field is an implicit call between the exit and the after call
    Full(u32, bool, Vec<Node>, Option<(u32, Vec<Node>)>),
    Dry(u32),
    Implicit(u32, Vec<Node>),
    Write,
}

fn tree() -> impl Strategy<Value = Vec<Node>> {
    let leaf = prop_oneof![(1u32..50).prop_map(Node::Dry), Just(Node::Write)];
    let node = leaf.prop_recursive(5, 64, 4, |inner| {
        prop_oneof![
            (
                1u32..50,
                any::<bool>(),
                prop::collection::vec(inner.clone(), 0..4),
                prop::option::weighted(0.2, (1u32..50, prop::collection::vec(inner.clone(), 0..2))),
            )
                .prop_map(|(u, e, c, l)| Node::Full(u, e, c, l)),
            (1u32..50, prop::collection::vec(inner, 0..4)).prop_map(|(u, c)| Node::Implicit(u, c)),
        ]
    });
    prop::collection::vec(node, 0..6)
}

fn tick(ts: &mut u64) -> u64 {
    *ts += 1;
    *ts
}

fn emit(nodes: &[Node], ts: &mut u64, out: &mut Vec<Message>) {
    for node in nodes {
        match node {
            Node::Full(unit, error, children, late) => {
                out.push(Message::BeforeCall {
                    timestamp: tick(ts),
                    probe: ProbeId(*unit),
                    unit: UnitId(*unit),
                    target: Value::Null,
                    args: vec![],
                });
                out.push(enter(tick(ts), *unit));
                emit(children, ts, out);
                if *error {
                    out.push(Message::ExitWithError {
                        timestamp: tick(ts),
                        unit: UnitId(*unit),
                        probe: ProbeId(0),
                        error: Value::Null,
                    });
                    emit_late(late, ts, out);
                    out.push(Message::AfterCallWithError {
                        timestamp: tick(ts),
                        probe: ProbeId(*unit),
                        unit: UnitId(*unit),
                        target: Value::Null,
                        error: Value::Null,
                    });
                } else {
                    out.push(exit(tick(ts), *unit));
                    emit_late(late, ts, out);
                    out.push(Message::AfterCall {
                        timestamp: tick(ts),
                        probe: ProbeId(*unit),
                        unit: UnitId(*unit),
                        target: Value::Null,
                        result: Value::Null,
                    });
                }
            }
            Node::Dry(unit) => {
                out.push(dry(tick(ts), *unit, 0));
                out.push(after_dry(tick(ts)));
            }
            Node::Implicit(unit, children) => {
                out.push(enter(tick(ts), *unit));
                emit(children, ts, out);
                out.push(exit(tick(ts), *unit));
            }
            Node::Write => out.push(Message::LocalWrite {
                timestamp: tick(ts),
                probe: ProbeId(1),
                slot: 0,
                value: Value::Int(0),
            }),
        }
    }
}

fn emit_late(late: &Option<(u32, Vec<Node>)>, ts: &mut u64, out: &mut Vec<Message>) {
    if let Some((unit, children)) = late {
        emit(&[Node::Implicit(*unit, children.clone())], ts, out);
    }
}

proptest! {
    #[test]
    fn frames_balance(nodes in tree()) {
        let mut messages = vec![];
        emit(&nodes, &mut 0, &mut messages);
        let (mut interpreter, events) = run(&messages);
        prop_assert_eq!(interpreter.depth(), 0);
        prop_assert_eq!(interpreter.repairs(), 0);
        prop_assert_eq!(interpreter.finish(&mut vec![]), 0);

        // calls and exits nest, body events hang under the innermost call,
        // implicit calls do not count for the depth
        let mut stack = Vec::<(u64, UnitId, bool)>::new();
        let depth = |stack: &[(u64, UnitId, bool)]| stack.iter().filter(|f| !f.2).count();
        for event in &events {
            prop_assert!(!event.synthetic);
            let parent = stack.last().map_or(0, |f| f.0);
            match &event.kind {
                EventKind::Call { unit, direct_parent, .. } => {
                    prop_assert_eq!(event.parent_timestamp, parent);
                    stack.push((event.timestamp, *unit, *direct_parent));
                    prop_assert_eq!(event.depth as usize, depth(&stack));
                }
                EventKind::Exit { unit, .. } | EventKind::ExitWithError { unit, .. } => {
                    prop_assert_eq!(event.depth as usize, depth(&stack));
                    let (_, open, _) = stack.pop().unwrap();
                    prop_assert_eq!(*unit, open);
                    let parent = stack.last().map_or(0, |f| f.0);
                    prop_assert_eq!(event.parent_timestamp, parent);
                }
                _ => {
                    prop_assert_eq!(event.parent_timestamp, parent);
                    prop_assert_eq!(event.depth as usize, depth(&stack));
                }
            }
        }
        prop_assert!(stack.is_empty());
    }
}
