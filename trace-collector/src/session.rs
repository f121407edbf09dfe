use std::{collections::BTreeMap, fmt, io};

use serde::Serialize;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use trace_wire::{Command, IdDelta, LoaderId, Message, Messages, ObjectId, ProducerId, TypeId};

use super::{
    catalog::{HasTrace, StructureCatalog},
    interpreter::{EventInterpreter, EventKind, TraceEvent},
    store::{Record, TraceSink},
    transport::{Transport, TransportError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{producer} registers {what} {id} again with different data")]
    Conflict {
        producer: ProducerId,
        what: &'static str,
        id: String,
    },
    #[error("store {0}")]
    Store(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub metapackets: u64,
    pub bytes: u64,
    pub packets: u64,
    pub messages: u64,
    pub events: u64,
    pub registrations: u64,
    pub repairs: u64,
    pub dropped_chunks: u64,
    pub producers: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, {} metapackets, {} packets, {} messages, {} events, {} registrations, \
             {} repairs, {} dropped chunks, {} producers",
            self.bytes,
            self.metapackets,
            self.packets,
            self.messages,
            self.events,
            self.registrations,
            self.repairs,
            self.dropped_chunks,
            self.producers,
        )
    }
}

/// What a session borrows from the collector while it handles data.
pub struct Cx<'a> {
    pub catalog: &'a mut StructureCatalog,
    pub store: &'a mut dyn TraceSink,
}

struct Producer {
    ids: IdDelta,
    interpreter: EventInterpreter,
}

/// Ids registered in the session, a second registration must be identical.
#[derive(Default)]
struct Registrations {
    objects: BTreeMap<ObjectId, Message>,
    types: BTreeMap<TypeId, (LoaderId, String)>,
    loaders: BTreeMap<LoaderId, (LoaderId, String)>,
    threads: BTreeMap<ProducerId, (u64, String)>,
}

fn register<K, V>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: V,
    producer: ProducerId,
    what: &'static str,
) -> Result<bool, SessionError>
where
    K: Ord + fmt::Display,
    V: PartialEq,
{
    match map.get(&key) {
        Some(existing) if *existing == value => Ok(false),
        Some(_) => Err(SessionError::Conflict {
            producer,
            what,
            id: key.to_string(),
        }),
        None => {
            map.insert(key, value);
            Ok(true)
        }
    }
}

impl Registrations {
    /// Returns whether the registration is new.
    fn check(
        &mut self,
        producer: ProducerId,
        msg: &Message,
        catalog: &StructureCatalog,
    ) -> Result<bool, SessionError> {
        match msg {
            Message::RegisterObject { id, .. } | Message::RegisterRefObject { id, .. } => {
                register(&mut self.objects, *id, msg.clone(), producer, "object")
            }
            Message::RegisterType { id, loader, name } => {
                let known = catalog.type_node(*id).filter(|node| node.loaded);
                if let Some(node) = known {
                    if node.name != *name {
                        log::error!("{producer} {id} is {name}, the catalog has {}", node.name);
                        return Err(SessionError::Conflict {
                            producer,
                            what: "type",
                            id: id.to_string(),
                        });
                    }
                }
                register(&mut self.types, *id, (*loader, name.clone()), producer, "type")
            }
            Message::RegisterLoader { id, parent, name } => {
                register(&mut self.loaders, *id, (*parent, name.clone()), producer, "loader")
            }
            Message::RegisterThread { host_id, name } => register(
                &mut self.threads,
                producer,
                (*host_id, name.clone()),
                producer,
                "thread",
            ),
            _ => Ok(false),
        }
    }
}

fn is_registration(msg: &Message) -> bool {
    matches!(
        msg,
        Message::RegisterObject { .. }
            | Message::RegisterRefObject { .. }
            | Message::RegisterType { .. }
            | Message::RegisterLoader { .. }
            | Message::RegisterThread { .. }
    )
}

/// Decoding state of one connection: transport, then per producer
/// delta decoding and call stack reconstruction.
pub struct Session {
    id: u64,
    peer: String,
    transport: Transport,
    producers: BTreeMap<ProducerId, Producer>,
    registrations: Registrations,
    stats: SessionStats,
    ended: bool,
    finished: bool,
    events: Vec<TraceEvent>,
}

impl Session {
    pub fn new(id: u64, peer: impl Into<String>, max_packet_size: usize) -> Self {
        Session {
            id,
            peer: peer.into(),
            transport: Transport::new(max_packet_size),
            producers: BTreeMap::new(),
            registrations: Registrations::default(),
            stats: SessionStats::default(),
            ended: false,
            finished: false,
            events: vec![],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The producer sent `End`.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn start(&mut self, cx: &mut Cx<'_>) -> Result<(), SessionError> {
        let started = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_owned());
        log::info!("session {} from {} started at {started}", self.id, self.peer);
        cx.store.record(Record::SessionStart {
            session: self.id,
            peer: self.peer.clone(),
            started,
        })?;
        Ok(())
    }

    pub fn on_data(&mut self, bytes: &[u8], cx: &mut Cx<'_>) -> Result<(), SessionError> {
        self.transport.push(bytes);
        while let Some((producer, packet)) = self.transport.next_packet()? {
            if self.ended {
                log::warn!(
                    "session {} {producer} sends {} bytes after the end",
                    self.id,
                    packet.len()
                );
                continue;
            }
            self.on_packet(producer, &packet, cx)?;
        }
        Ok(())
    }

    pub fn on_packet(
        &mut self,
        producer: ProducerId,
        packet: &[u8],
        cx: &mut Cx<'_>,
    ) -> Result<(), SessionError> {
        let session = self.id;
        let state = self.producers.entry(producer).or_insert_with(|| {
            log::debug!("session {session} {producer} first packet");
            Producer {
                ids: IdDelta::default(),
                interpreter: EventInterpreter::new(producer),
            }
        });
        let Producer { ids, interpreter } = state;

        let mut clear = false;
        let mut messages = Messages::new(packet, &mut *ids);
        loop {
            let position = messages.position();
            let Some(msg) = messages.next() else {
                break;
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(source) => {
                    log::error!(
                        "session {session} {producer} decode failed at {position}, packet {}",
                        hex::encode(&packet[..packet.len().min(64)]),
                    );
                    return Err(TransportError::Decode {
                        producer,
                        position,
                        source,
                    }
                    .into());
                }
            };
            self.stats.messages += 1;

            if let Message::Command(command) = &msg {
                match command {
                    Command::Clear => {
                        log::info!("session {session} {producer} clear");
                        cx.store.record(Record::Clear { session })?;
                        clear = true;
                    }
                    Command::Flush => cx.store.flush()?,
                    Command::End => {
                        log::info!("session {session} {producer} end");
                        self.ended = true;
                    }
                    Command::CaptureEnabled(enabled) => {
                        log::info!("session {session} {producer} capture {enabled}");
                        cx.store.record(Record::Capture {
                            session,
                            enabled: *enabled,
                        })?;
                    }
                }
                continue;
            }

            if is_registration(&msg) {
                if self.registrations.check(producer, &msg, &*cx.catalog)? {
                    self.stats.registrations += 1;
                    cx.store.record(Record::Registration {
                        session,
                        producer,
                        message: msg,
                    })?;
                } else {
                    log::debug!("session {session} {producer} registers again {msg:?}");
                }
                continue;
            }

            interpreter.on_message(&msg, &mut self.events);
            for event in self.events.drain(..) {
                record_event(session, event, cx)?;
            }
        }
        // the delta state of the channel restarts after a clear
        if clear {
            ids.reset();
        }
        Ok(())
    }

    /// The stream ended, closes open long packets and call frames.
    pub fn finish(&mut self, cx: &mut Cx<'_>) -> Result<SessionStats, SessionError> {
        if self.finished {
            return Ok(self.stats());
        }
        self.finished = true;
        let transport = self.transport.finish();
        for state in self.producers.values_mut() {
            state.interpreter.finish(&mut self.events);
        }
        for event in self.events.drain(..) {
            record_event(self.id, event, cx)?;
        }
        let stats = self.stats();
        if !self.ended {
            log::warn!("session {} closed without an end", self.id);
        }
        log::info!("session {} finished: {stats}", self.id);
        cx.store.record(Record::SessionEnd {
            session: self.id,
            stats: stats.clone(),
        })?;
        cx.store.flush()?;
        transport?;
        Ok(stats)
    }

    pub fn stats(&self) -> SessionStats {
        let transport = self.transport.stats();
        let mut stats = SessionStats {
            metapackets: transport.metapackets,
            bytes: transport.bytes,
            packets: transport.packets,
            dropped_chunks: transport.dropped_chunks,
            producers: self.producers.len() as u64,
            ..self.stats.clone()
        };
        for state in self.producers.values() {
            stats.events += state.interpreter.events();
            stats.repairs += state.interpreter.repairs();
        }
        stats
    }
}

fn record_event(session: u64, event: TraceEvent, cx: &mut Cx<'_>) -> Result<(), SessionError> {
    if let EventKind::Call { unit, .. } = &event.kind {
        if !event.synthetic && unit.get().is_some() && cx.catalog.unit(*unit).is_some() {
            cx.catalog.set_has_trace(*unit, HasTrace::Yes).ok();
        }
    }
    cx.store.record(Record::Event { session, event })?;
    Ok(())
}

#[cfg(test)]
mod tests;
