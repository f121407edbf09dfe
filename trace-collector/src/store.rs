use std::{
    io::{self, Write},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use trace_wire::{Message, ProducerId};

use super::{interpreter::TraceEvent, session::SessionStats};

/// What the collector hands downstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "record")]
pub enum Record {
    SessionStart {
        session: u64,
        peer: String,
        started: String,
    },
    Event {
        session: u64,
        event: TraceEvent,
    },
    Registration {
        session: u64,
        producer: ProducerId,
        message: Message,
    },
    Capture {
        session: u64,
        enabled: bool,
    },
    Clear {
        session: u64,
    },
    SessionEnd {
        session: u64,
        stats: SessionStats,
    },
}

pub trait TraceSink {
    fn record(&mut self, record: Record) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Records in memory, a `Clear` drops everything recorded before.
/// Clones share the records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryStore {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Event { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for MemoryStore {
    fn record(&mut self, record: Record) -> io::Result<()> {
        let mut records = self.records.lock();
        if let Record::Clear { .. } = &record {
            records.clear();
        }
        records.push(record);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonStore<W>
where
    W: Write,
{
    inner: io::BufWriter<W>,
    written: u64,
}

impl<W> JsonStore<W>
where
    W: Write,
{
    pub fn new(inner: W) -> Self {
        JsonStore {
            inner: io::BufWriter::new(inner),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|err| err.into_error())
    }
}

impl<W> TraceSink for JsonStore<W>
where
    W: Write,
{
    fn record(&mut self, record: Record) -> io::Result<()> {
        serde_json::to_writer(&mut self.inner, &record)?;
        self.inner.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use trace_wire::{ProducerId, UnitId, Value, ProbeId};

    use super::{JsonStore, MemoryStore, Record, TraceSink};
    use crate::interpreter::{EventKind, TraceEvent};

    fn event() -> Record {
        Record::Event {
            session: 1,
            event: TraceEvent {
                producer: ProducerId(2),
                timestamp: 5,
                parent_timestamp: 3,
                depth: 1,
                advice: None,
                synthetic: false,
                kind: EventKind::Exit {
                    unit: UnitId(4),
                    probe: ProbeId(0),
                    result: Value::Int(7),
                },
            },
        }
    }

    #[test]
    fn memory_clear() {
        let store = MemoryStore::default();
        let mut sink = store.clone();
        sink.record(event()).unwrap();
        sink.record(event()).unwrap();
        assert_eq!(store.events().len(), 2);
        sink.record(Record::Clear { session: 1 }).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.events().is_empty());
    }

    #[test]
    fn json_lines() {
        let mut store = JsonStore::new(vec![]);
        store.record(event()).unwrap();
        store.record(Record::Capture { session: 1, enabled: false }).unwrap();
        store.flush().unwrap();
        assert_eq!(store.written(), 2);
        let text = String::from_utf8(store.into_inner().unwrap()).unwrap();
        let lines = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"], "event");
        assert_eq!(lines[0]["event"]["kind"], "exit");
        assert_eq!(lines[0]["event"]["unit"], 4);
        assert_eq!(lines[0]["event"]["result"]["type"], "int");
        assert!(lines[0]["event"].get("synthetic").is_none());
        assert_eq!(lines[1]["enabled"], false);
    }
}
