use std::{fmt, sync::Arc};

use rand::{rngs::StdRng, Rng};
use trace_agent::{Agent, HostContents, HostObject, HostValue, ObjectKey, ThreadChannel};
use trace_collector::{catalog::UnitKind, StructureCatalog, TypeDef, UnitDef};
use trace_wire::{FieldId, OutputStream, ProbeId, TypeId, UnitId};

pub const ROOT: &str = "java.lang.Object";

const WORKER: &str = "app.Worker";
const TEXT: &str = "java.lang.String";

fn unit(name: &str, signature: &str) -> UnitDef {
    UnitDef {
        name: name.to_owned(),
        signature: signature.to_owned(),
        ..UnitDef::default()
    }
}

/// Types of the generated program, `steps` is the number of methods the
/// trees are made of.
pub fn types(steps: usize) -> Vec<TypeDef> {
    let mut units = vec![
        unit("run", "()V"),
        UnitDef {
            is_static: true,
            kind: UnitKind::Initializer,
            ..unit("<clinit>", "()V")
        },
    ];
    units.extend((0..steps).map(|i| unit(&format!("step{i}"), "(I)I")));
    vec![
        TypeDef {
            name: TEXT.to_owned(),
            super_type: Some(ROOT.to_owned()),
            ..TypeDef::default()
        },
        TypeDef {
            name: WORKER.to_owned(),
            super_type: Some(ROOT.to_owned()),
            units,
            fields: vec!["value".to_owned(), "items".to_owned()],
            ..TypeDef::default()
        },
    ]
}

/// Ids of the program as a collector loading the same types assigns them.
pub struct Program {
    run: UnitId,
    init: UnitId,
    steps: Vec<UnitId>,
    fields: Vec<FieldId>,
    worker: TypeId,
    text: TypeId,
}

impl Program {
    pub fn new(defs: &[TypeDef]) -> anyhow::Result<Self> {
        let mut catalog = StructureCatalog::default();
        catalog.type_id(ROOT);
        for def in defs {
            catalog.define_type(def)?;
        }
        let worker = catalog.type_id(WORKER);
        let text = catalog.type_id(TEXT);
        let node = catalog
            .type_node(worker)
            .ok_or_else(|| anyhow::anyhow!("{WORKER} is not defined"))?;
        let mut program = Program {
            run: UnitId::NONE,
            init: UnitId::NONE,
            steps: vec![],
            fields: node.fields.clone(),
            worker,
            text,
        };
        for id in &node.units {
            let Some(u) = catalog.unit(*id) else {
                continue;
            };
            match u.name.as_str() {
                "run" => program.run = u.id,
                "<clinit>" => program.init = u.id,
                _ => program.steps.push(u.id),
            }
        }
        if program.run.get().is_none() || program.steps.is_empty() || program.fields.is_empty() {
            anyhow::bail!("{WORKER} misses units or fields");
        }
        Ok(program)
    }
}

struct Object {
    key: ObjectKey,
    type_id: TypeId,
    text: Option<String>,
    value: i32,
}

impl HostObject for Object {
    fn key(&self) -> ObjectKey {
        self.key
    }

    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn by_value(&self) -> bool {
        self.text.is_some()
    }

    fn contents(&self) -> HostContents {
        match &self.text {
            Some(text) => HostContents::Text(text.clone()),
            None => HostContents::Fields(vec![("value".to_owned(), HostValue::Int(self.value))]),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub trees: u64,
    pub calls: u64,
    pub dry: u64,
    pub implicit: u64,
    pub errors: u64,
    pub writes: u64,
    pub evictions: u64,
}

impl Stats {
    pub fn add(&mut self, other: &Stats) {
        self.trees += other.trees;
        self.calls += other.calls;
        self.dry += other.dry;
        self.implicit += other.implicit;
        self.errors += other.errors;
        self.writes += other.writes;
        self.evictions += other.evictions;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trees, {} full calls, {} dry calls, {} implicit calls, {} errors, {} writes, {} evictions",
            self.trees, self.calls, self.dry, self.implicit, self.errors, self.writes, self.evictions
        )
    }
}

const POOL: u32 = 16;

/// One instrumented thread running random, balanced call trees.
pub struct Worker<'a> {
    agent: &'a Agent,
    program: &'a Program,
    channel: ThreadChannel,
    rng: StdRng,
    max_depth: usize,
    objects: Vec<Arc<Object>>,
    // slots of this worker start here, workers never share a slot
    base_slot: u32,
    next_slot: u32,
    next_probe: u32,
    stats: Stats,
}

impl<'a> Worker<'a> {
    pub fn new(
        agent: &'a Agent,
        program: &'a Program,
        index: u32,
        rng: StdRng,
        max_depth: usize,
    ) -> Self {
        let channel = agent.channel(u64::from(index), &format!("worker-{index}"));
        let base_slot = index << 20;
        let objects = (0..POOL)
            .map(|i| {
                Arc::new(Object {
                    key: ObjectKey {
                        slot: base_slot + i,
                        generation: 0,
                    },
                    type_id: program.worker,
                    text: None,
                    value: i as i32,
                })
            })
            .collect();
        Worker {
            agent,
            program,
            channel,
            rng,
            max_depth,
            objects,
            base_slot,
            next_slot: POOL,
            next_probe: 1,
            stats: Stats::default(),
        }
    }

    pub fn run(mut self, trees: usize) -> Stats {
        if self.program.init.get().is_some() {
            let probe = self.probe();
            self.channel.enter(self.program.init, &HostValue::Null, &[]);
            self.channel.exit(self.program.init, probe, &HostValue::Null);
        }
        for _ in 0..trees {
            let this = self.object();
            self.channel.enter(self.program.run, &this, &[]);
            self.body(1);
            let probe = self.probe();
            self.channel.exit(self.program.run, probe, &HostValue::Null);
            self.stats.trees += 1;
            if self.rng.gen_bool(0.2) {
                self.evict();
            }
        }
        self.channel.flush();
        self.stats
    }

    fn probe(&mut self) -> ProbeId {
        self.next_probe += 1;
        ProbeId(self.next_probe)
    }

    fn step(&mut self) -> UnitId {
        let index = self.rng.gen_range(0..self.program.steps.len());
        self.program.steps[index]
    }

    fn object(&mut self) -> HostValue {
        let index = self.rng.gen_range(0..self.objects.len());
        HostValue::Object(self.objects[index].clone())
    }

    fn text(&mut self, text: &str) -> HostValue {
        let slot = self.base_slot + self.next_slot;
        self.next_slot += 1;
        HostValue::Object(Arc::new(Object {
            key: ObjectKey {
                slot,
                generation: 0,
            },
            type_id: self.program.text,
            text: Some(text.to_owned()),
            value: 0,
        }))
    }

    fn value(&mut self) -> HostValue {
        match self.rng.gen_range(0..7) {
            0 => HostValue::Null,
            1 => HostValue::Int(self.rng.gen()),
            2 => HostValue::Long(self.rng.gen()),
            3 => HostValue::Double(self.rng.gen()),
            4 => HostValue::Bool(self.rng.gen()),
            5 => HostValue::Char(self.rng.gen_range(0x20..0x7f)),
            _ => self.object(),
        }
    }

    /// The host collected an object, its slot is reused by a new one.
    fn evict(&mut self) {
        let index = self.rng.gen_range(0..self.objects.len());
        let old = &self.objects[index];
        if self.agent.registry().evict(old.key) {
            self.stats.evictions += 1;
        }
        let object = Object {
            key: ObjectKey {
                slot: old.key.slot,
                generation: old.key.generation + 1,
            },
            type_id: old.type_id,
            text: None,
            value: self.rng.gen(),
        };
        self.objects[index] = Arc::new(object);
    }

    fn body(&mut self, depth: usize) {
        let count = self.rng.gen_range(1..=4);
        for _ in 0..count {
            let choice = if depth >= self.max_depth {
                self.rng.gen_range(3..8)
            } else {
                self.rng.gen_range(0..8)
            };
            match choice {
                0 => self.full_call(depth),
                1 => self.dry_call(depth),
                2 => self.implicit_call(depth),
                3 => {
                    let field = self.program.fields[self.rng.gen_range(0..self.program.fields.len())];
                    let (probe, target, value) = (self.probe(), self.object(), self.value());
                    self.channel.field_write(probe, field, &target, &value);
                    self.stats.writes += 1;
                }
                4 => {
                    let size = self.rng.gen_range(1..8);
                    let array = self.object();
                    let probe = self.probe();
                    self.channel.new_array(probe, &array, self.program.worker, size);
                    let (probe, value) = (self.probe(), self.value());
                    let index = self.rng.gen_range(0..size);
                    self.channel.array_write(probe, &array, index, &value);
                    self.stats.writes += 1;
                }
                5 => {
                    let (probe, value) = (self.probe(), self.value());
                    let slot = self.rng.gen_range(0..8);
                    self.channel.local_write(probe, slot, &value);
                    self.stats.writes += 1;
                }
                6 => {
                    let stream = if self.rng.gen_bool(0.8) {
                        OutputStream::Out
                    } else {
                        OutputStream::Err
                    };
                    let line = format!("depth {depth}\n");
                    self.channel.output(stream, &line);
                }
                _ => {
                    let (probe, value) = (self.probe(), self.object());
                    let result = self.rng.gen();
                    self.channel.type_check(probe, &value, self.program.worker, result);
                }
            }
        }
    }

    fn full_call(&mut self, depth: usize) {
        let unit = self.step();
        let probe = self.probe();
        let target = self.object();
        let args = [HostValue::Int(self.rng.gen_range(0..100)), self.value()];
        self.channel.before_call(probe, unit, &target, &args);
        self.stats.calls += 1;
        // the callee may be compiled without instrumentation and never enter
        if self.rng.gen_bool(0.9) {
            self.channel.enter(unit, &target, &args);
            self.body(depth + 1);
            if self.rng.gen_bool(0.1) {
                let error = self.text("failed");
                let throw = self.probe();
                self.channel.exception(unit, throw, &error);
                self.channel.exit_with_error(unit, throw, &error);
                self.channel.after_call_with_error(probe, unit, &target, &error);
                self.stats.errors += 1;
                return;
            }
            let exit = self.probe();
            let result = HostValue::Int(self.rng.gen());
            self.channel.exit(unit, exit, &result);
            self.channel.after_call(probe, unit, &target, &result);
        } else {
            self.channel.after_call(probe, unit, &target, &HostValue::Int(0));
        }
    }

    fn dry_call(&mut self, depth: usize) {
        let unit = self.step();
        let probe = self.probe();
        self.channel.before_call_dry(probe, unit, None);
        self.stats.dry += 1;
        if depth < self.max_depth && self.rng.gen_bool(0.3) {
            self.dry_call(depth + 1);
        }
        self.channel.after_call_dry(probe);
    }

    /// A callback from code that is not instrumented, no call site precedes it.
    fn implicit_call(&mut self, depth: usize) {
        let unit = self.step();
        let target = self.object();
        let args = [self.value()];
        self.channel.enter(unit, &target, &args);
        self.stats.implicit += 1;
        self.body(depth + 1);
        let probe = self.probe();
        self.channel.exit(unit, probe, &HostValue::Null);
    }
}
