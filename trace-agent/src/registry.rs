use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use trace_wire::{GraphValue, NodePayload, ObjectGraph, ObjectId, ObjectNode, TypeId, Value};

/// Arena slot of a host object. A slot is reused with a new generation
/// after the host collected the previous occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub slot: u32,
    pub generation: u32,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

pub enum HostContents {
    Text(String),
    Fields(Vec<(String, HostValue)>),
}

/// An object of the instrumented program as seen by the agent.
pub trait HostObject: Send + Sync {
    fn key(&self) -> ObjectKey;

    fn type_id(&self) -> TypeId;

    /// Text and error objects are registered with their contents.
    fn by_value(&self) -> bool {
        false
    }

    fn contents(&self) -> HostContents;
}

#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Arc<dyn HostObject>),
}

const UNSENT: u64 = 1 << 63;

struct Entry {
    generation: u32,
    // the top bit is set until a packet carrying the registration reached the sink
    id: u64,
    first_seen: u64,
}

struct Inner {
    next_id: u64,
    entries: BTreeMap<u32, Entry>,
}

/// Assigns odd identities to host objects, even ids are left to producer-local scratch use.
pub struct ObjectRegistry {
    inner: Mutex<Inner>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        ObjectRegistry {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
        }
    }
}

impl ObjectRegistry {
    /// Returns the negated id if the object is seen for the first time.
    pub fn get_or_assign(&self, key: ObjectKey, timestamp: u64) -> i64 {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(&key.slot) {
            if entry.generation == key.generation {
                return (entry.id & !UNSENT) as i64;
            }
        }
        let id = inner.next_id;
        inner.next_id += 2;
        inner.entries.insert(
            key.slot,
            Entry {
                generation: key.generation,
                id: id | UNSENT,
                first_seen: timestamp,
            },
        );
        -(id as i64)
    }

    pub fn lookup(&self, key: ObjectKey) -> Option<ObjectId> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key.slot)
            .filter(|e| e.generation == key.generation)
            .map(|e| ObjectId(e.id & !UNSENT))
    }

    pub fn first_seen(&self, key: ObjectKey) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key.slot)
            .filter(|e| e.generation == key.generation)
            .map(|e| e.first_seen)
    }

    /// Whether a registration of the object was handed to the sink. Until
    /// then, another thread referencing the object carries its own copy.
    pub fn is_sent(&self, key: ObjectKey) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key.slot)
            .filter(|e| e.generation == key.generation)
            .map_or(false, |e| e.id & UNSENT == 0)
    }

    pub fn mark_sent(&self, key: ObjectKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key.slot) {
            if entry.generation == key.generation {
                entry.id &= !UNSENT;
            }
        }
    }

    /// Called by the host when the object is collected.
    pub fn evict(&self, key: ObjectKey) -> bool {
        let mut inner = self.inner.lock();
        let matches = inner
            .entries
            .get(&key.slot)
            .map_or(false, |e| e.generation == key.generation);
        if matches {
            inner.entries.remove(&key.slot);
        }
        matches
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reference whose registration must precede the first event using it.
pub struct Pending {
    pub id: ObjectId,
    pub object: Arc<dyn HostObject>,
}

/// Converts host values into wire values, collecting objects whose
/// registration has to precede the event.
pub struct Converter<'a> {
    registry: &'a ObjectRegistry,
    timestamp: u64,
    // registrations already in the packet under construction
    carried: &'a BTreeSet<ObjectKey>,
    pending: &'a mut Vec<Pending>,
}

impl<'a> Converter<'a> {
    pub fn new(
        registry: &'a ObjectRegistry,
        timestamp: u64,
        carried: &'a BTreeSet<ObjectKey>,
        pending: &'a mut Vec<Pending>,
    ) -> Self {
        Converter {
            registry,
            timestamp,
            carried,
            pending,
        }
    }

    pub fn value(&mut self, value: &HostValue) -> Value {
        match value {
            HostValue::Null => Value::Null,
            HostValue::Bool(v) => Value::Bool(*v),
            HostValue::Byte(v) => Value::Byte(*v),
            HostValue::Char(v) => Value::Char(*v),
            HostValue::Short(v) => Value::Short(*v),
            HostValue::Int(v) => Value::Int(*v),
            HostValue::Long(v) => Value::Long(*v),
            HostValue::Float(v) => Value::Float(*v),
            HostValue::Double(v) => Value::Double(*v),
            HostValue::Object(object) => {
                let key = object.key();
                let id = self.registry.get_or_assign(key, self.timestamp);
                let first = id < 0;
                let id = ObjectId(id.unsigned_abs());
                // the first registration may still sit in an unflushed packet of another thread
                let unsent = !first
                    && !self.carried.contains(&key)
                    && !self.registry.is_sent(key)
                    && !self.pending.iter().any(|p| p.id == id);
                if first || unsent {
                    self.pending.push(Pending {
                        id,
                        object: object.clone(),
                    });
                }
                Value::Object(id)
            }
        }
    }

    pub fn values(&mut self, values: &[HostValue]) -> Vec<Value> {
        values.iter().map(|v| self.value(v)).collect()
    }

    /// Walks the by-value part of the object graph. Nested by-value objects
    /// become nodes, the rest become references. Visited objects are keyed
    /// by identity so cycles terminate.
    pub fn graph(&mut self, root: &Arc<dyn HostObject>) -> ObjectGraph {
        let mut visited = BTreeMap::new();
        let mut nodes = vec![];
        let mut queue = vec![root.clone()];
        visited.insert(root.key(), 0u32);

        let mut i = 0;
        while i < queue.len() {
            let object = queue[i].clone();
            i += 1;
            let payload = match object.contents() {
                HostContents::Text(text) => NodePayload::Text(text),
                HostContents::Fields(fields) => {
                    let mut converted = Vec::with_capacity(fields.len());
                    for (name, value) in fields {
                        let value = match &value {
                            HostValue::Object(nested) if nested.by_value() => {
                                let next = visited.len() as u32;
                                let index = *visited.entry(nested.key()).or_insert_with(|| {
                                    queue.push(nested.clone());
                                    next
                                });
                                GraphValue::Node(index)
                            }
                            value => GraphValue::Value(self.value(value)),
                        };
                        converted.push((name, value));
                    }
                    NodePayload::Fields(converted)
                }
            };
            nodes.push(ObjectNode {
                type_id: object.type_id(),
                payload,
            });
        }
        ObjectGraph { nodes }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use parking_lot::Mutex;
    use trace_wire::{GraphValue, NodePayload, ObjectId, TypeId, Value};

    use super::{Converter, HostContents, HostObject, HostValue, ObjectKey, ObjectRegistry};

    struct Node {
        key: ObjectKey,
        by_value: bool,
        next: Mutex<Option<Arc<dyn HostObject>>>,
    }

    impl HostObject for Node {
        fn key(&self) -> ObjectKey {
            self.key
        }

        fn type_id(&self) -> TypeId {
            TypeId(1)
        }

        fn by_value(&self) -> bool {
            self.by_value
        }

        fn contents(&self) -> HostContents {
            let next = match &*self.next.lock() {
                Some(next) => HostValue::Object(next.clone()),
                None => HostValue::Null,
            };
            HostContents::Fields(vec![("next".to_owned(), next), ("n".to_owned(), HostValue::Int(1))])
        }
    }

    fn node(slot: u32, by_value: bool) -> Arc<Node> {
        Arc::new(Node {
            key: ObjectKey {
                slot,
                generation: 0,
            },
            by_value,
            next: Mutex::new(None),
        })
    }

    #[test]
    fn ids_are_odd_and_negated_once() {
        let registry = ObjectRegistry::default();
        let a = ObjectKey {
            slot: 5,
            generation: 0,
        };
        let b = ObjectKey {
            slot: 6,
            generation: 0,
        };
        assert_eq!(registry.get_or_assign(a, 10), -1);
        assert_eq!(registry.get_or_assign(b, 11), -3);
        assert_eq!(registry.get_or_assign(a, 12), 1);
        assert_eq!(registry.first_seen(a), Some(10));
        assert!(!registry.is_sent(a));
        registry.mark_sent(a);
        assert!(registry.is_sent(a));
        assert_eq!(registry.get_or_assign(a, 13), 1);
    }

    #[test]
    fn eviction_and_reuse() {
        let registry = ObjectRegistry::default();
        let old = ObjectKey {
            slot: 1,
            generation: 0,
        };
        let new = ObjectKey {
            slot: 1,
            generation: 1,
        };
        registry.get_or_assign(old, 0);
        assert!(!registry.evict(new));
        assert!(registry.evict(old));
        assert_eq!(registry.lookup(old), None);
        assert_eq!(registry.get_or_assign(new, 0), -3);
        // a stale key misses after the slot was reused
        assert_eq!(registry.lookup(old), None);
        assert_eq!(registry.lookup(new), Some(ObjectId(3)));
    }

    #[test]
    fn cyclic_by_value_graph() {
        let a = node(1, true);
        let b = node(2, true);
        *a.next.lock() = Some(b.clone());
        *b.next.lock() = Some(a.clone());

        let registry = ObjectRegistry::default();
        let mut pending = vec![];
        let root: Arc<dyn HostObject> = a.clone();
        let graph = Converter::new(&registry, 0, &BTreeSet::new(), &mut pending).graph(&root);
        assert_eq!(graph.nodes.len(), 2);
        let next = |i: usize| match &graph.nodes[i].payload {
            NodePayload::Fields(fields) => fields[0].1.clone(),
            _ => panic!("expected fields"),
        };
        assert_eq!(next(0), GraphValue::Node(1));
        assert_eq!(next(1), GraphValue::Node(0));
        assert!(pending.is_empty());
    }

    #[test]
    fn nested_reference_is_pending() {
        let a = node(1, true);
        let b = node(2, false);
        *a.next.lock() = Some(b.clone());

        let registry = ObjectRegistry::default();
        let mut pending = vec![];
        let root: Arc<dyn HostObject> = a.clone();
        let graph = Converter::new(&registry, 0, &BTreeSet::new(), &mut pending).graph(&root);
        assert_eq!(graph.nodes.len(), 1);
        match &graph.nodes[0].payload {
            NodePayload::Fields(fields) => {
                assert_eq!(fields[0].1, GraphValue::Value(Value::Object(ObjectId(1))));
            }
            _ => panic!("expected fields"),
        }
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ObjectId(1));
    }
}
