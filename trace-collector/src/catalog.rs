use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Deserialize};
use thiserror::Error;
use trace_wire::{AdviceId, FieldId, InstrumentationMode, LoaderId, ProbeId, TypeId, UnitId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("type {0} is already loaded")]
    DuplicateType(String),
    #[error("{0} is not in the catalog")]
    UnknownType(TypeId),
    #[error("{0} is not in the catalog")]
    UnknownUnit(UnitId),
    #[error("unit {name}{signature} is declared twice in {type_name}")]
    DuplicateUnit {
        type_name: String,
        name: String,
        signature: String,
    },
    #[error("type {0} cannot extend itself")]
    SelfParent(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    #[default]
    None,
    Envelope,
    Full,
    /// Left alone by scope propagation.
    Special,
}

impl MonitoringMode {
    pub fn instrumentation(&self) -> InstrumentationMode {
        match self {
            MonitoringMode::None | MonitoringMode::Special => InstrumentationMode::None,
            MonitoringMode::Envelope => InstrumentationMode::Envelope,
            MonitoringMode::Full => InstrumentationMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasTrace {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    Method,
    Constructor,
    /// Static initializer, runs at unpredictable points.
    Initializer,
}

/// How a type is described by the instrumentation layer when it loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(default)]
    pub loader: Option<String>,
    #[serde(default)]
    pub super_type: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub units: Vec<UnitDef>,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDef {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub kind: UnitKind,
    #[serde(default)]
    pub native: bool,
    #[serde(default)]
    pub special: bool,
    /// Bytecode indices of the probes placed in the unit.
    #[serde(default)]
    pub probes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeNode {
    pub id: TypeId,
    pub name: String,
    pub loader: LoaderId,
    pub super_type: TypeId,
    pub interfaces: Vec<TypeId>,
    pub units: Vec<UnitId>,
    pub fields: Vec<FieldId>,
    /// Known by name only, referenced by a loaded type.
    pub loaded: bool,
}

impl TypeNode {
    pub fn parents(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.super_type
            .get()
            .into_iter()
            .chain(self.interfaces.iter().copied())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutableUnit {
    pub id: UnitId,
    pub declaring_type: TypeId,
    pub name: String,
    pub signature: String,
    pub is_static: bool,
    pub kind: UnitKind,
    pub native: bool,
    pub mode: MonitoringMode,
    pub call_monitored: bool,
    pub has_trace: HasTrace,
}

impl ExecutableUnit {
    /// Whether calls to the unit are dispatched through the type hierarchy.
    pub fn is_virtual(&self) -> bool {
        !self.is_static && self.kind == UnitKind::Method
    }

    /// The key shared by units overriding each other.
    pub fn signature_key(&self) -> String {
        format!("{}{}", self.name, self.signature)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldInfo {
    pub id: FieldId,
    pub declaring_type: TypeId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub unit: UnitId,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdviceInfo {
    pub id: AdviceId,
    pub name: String,
}

/// Registry of types, units, fields, probes and advice. Ids start at `1`,
/// `0` is reserved for "none" on the wire.
#[derive(Default)]
pub struct StructureCatalog {
    types: Vec<TypeNode>,
    units: Vec<ExecutableUnit>,
    fields: Vec<FieldInfo>,
    probes: Vec<ProbeInfo>,
    advice: Vec<AdviceInfo>,
    loaders: Vec<String>,
    type_names: BTreeMap<String, TypeId>,
    unit_names: BTreeMap<(TypeId, String, String), UnitId>,
    field_names: BTreeMap<(TypeId, String), FieldId>,
    probe_index: BTreeMap<(UnitId, u32), ProbeId>,
    advice_names: BTreeMap<String, AdviceId>,
    loader_names: BTreeMap<String, LoaderId>,
}

fn index(id: u32) -> Option<usize> {
    (id as usize).checked_sub(1)
}

impl StructureCatalog {
    /// Id of the type with this name, a placeholder node is created if needed.
    pub fn type_id(&mut self, name: &str) -> TypeId {
        if let Some(id) = self.type_names.get(name) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32 + 1);
        self.types.push(TypeNode {
            id,
            name: name.to_owned(),
            loader: LoaderId::NONE,
            super_type: TypeId::NONE,
            interfaces: vec![],
            units: vec![],
            fields: vec![],
            loaded: false,
        });
        self.type_names.insert(name.to_owned(), id);
        id
    }

    pub fn loader_id(&mut self, name: &str) -> LoaderId {
        if let Some(id) = self.loader_names.get(name) {
            return *id;
        }
        self.loaders.push(name.to_owned());
        let id = LoaderId(self.loaders.len() as u32);
        self.loader_names.insert(name.to_owned(), id);
        id
    }

    /// Records a loaded type with its units, fields and probes.
    pub fn define_type(&mut self, def: &TypeDef) -> Result<TypeId, CatalogError> {
        let id = self.type_id(&def.name);
        if self.types[id.0 as usize - 1].loaded {
            return Err(CatalogError::DuplicateType(def.name.clone()));
        }
        let super_type = match &def.super_type {
            Some(name) if *name == def.name => return Err(CatalogError::SelfParent(name.clone())),
            Some(name) => self.type_id(name),
            None => TypeId::NONE,
        };
        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for name in &def.interfaces {
            if *name == def.name {
                return Err(CatalogError::SelfParent(name.clone()));
            }
            interfaces.push(self.type_id(name));
        }
        let mut seen = BTreeSet::new();
        for unit in &def.units {
            if !seen.insert((&unit.name, &unit.signature)) {
                return Err(CatalogError::DuplicateUnit {
                    type_name: def.name.clone(),
                    name: unit.name.clone(),
                    signature: unit.signature.clone(),
                });
            }
        }
        let loader = match &def.loader {
            Some(name) => self.loader_id(name),
            None => LoaderId::NONE,
        };

        let units = def.units.iter().map(|u| self.add_unit(id, u)).collect::<Vec<_>>();
        let fields = def.fields.iter().map(|f| self.add_field(id, f)).collect::<Vec<_>>();

        let node = &mut self.types[id.0 as usize - 1];
        node.loader = loader;
        node.super_type = super_type;
        node.interfaces = interfaces;
        node.units = units;
        node.fields = fields;
        node.loaded = true;
        log::debug!("{id} loaded {}", def.name);
        Ok(id)
    }

    fn add_unit(&mut self, declaring_type: TypeId, def: &UnitDef) -> UnitId {
        let id = UnitId(self.units.len() as u32 + 1);
        self.units.push(ExecutableUnit {
            id,
            declaring_type,
            name: def.name.clone(),
            signature: def.signature.clone(),
            is_static: def.is_static || def.kind == UnitKind::Initializer,
            kind: def.kind,
            native: def.native,
            mode: if def.special {
                MonitoringMode::Special
            } else {
                MonitoringMode::None
            },
            call_monitored: false,
            has_trace: HasTrace::Unknown,
        });
        self.unit_names
            .insert((declaring_type, def.name.clone(), def.signature.clone()), id);
        for index in &def.probes {
            self.add_probe(id, *index);
        }
        id
    }

    fn add_field(&mut self, declaring_type: TypeId, name: &str) -> FieldId {
        let id = FieldId(self.fields.len() as u32 + 1);
        self.fields.push(FieldInfo {
            id,
            declaring_type,
            name: name.to_owned(),
        });
        self.field_names.insert((declaring_type, name.to_owned()), id);
        id
    }

    pub fn add_probe(&mut self, unit: UnitId, index: u32) -> ProbeId {
        if let Some(id) = self.probe_index.get(&(unit, index)) {
            return *id;
        }
        let id = ProbeId(self.probes.len() as u32 + 1);
        self.probes.push(ProbeInfo { id, unit, index });
        self.probe_index.insert((unit, index), id);
        id
    }

    pub fn add_advice(&mut self, name: &str) -> AdviceId {
        if let Some(id) = self.advice_names.get(name) {
            return *id;
        }
        let id = AdviceId(self.advice.len() as u32 + 1);
        self.advice.push(AdviceInfo {
            id,
            name: name.to_owned(),
        });
        self.advice_names.insert(name.to_owned(), id);
        id
    }

    pub fn type_node(&self, id: TypeId) -> Option<&TypeNode> {
        self.types.get(index(id.0)?)
    }

    pub fn unit(&self, id: UnitId) -> Option<&ExecutableUnit> {
        self.units.get(index(id.0)?)
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Result<&mut ExecutableUnit, CatalogError> {
        index(id.0)
            .and_then(|i| self.units.get_mut(i))
            .ok_or(CatalogError::UnknownUnit(id))
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldInfo> {
        self.fields.get(index(id.0)?)
    }

    pub fn probe(&self, id: ProbeId) -> Option<&ProbeInfo> {
        self.probes.get(index(id.0)?)
    }

    pub fn advice(&self, id: AdviceId) -> Option<&AdviceInfo> {
        self.advice.get(index(id.0)?)
    }

    pub fn type_by_name(&self, name: &str) -> Option<&TypeNode> {
        self.type_names.get(name).and_then(|id| self.type_node(*id))
    }

    pub fn unit_by_name(&self, type_id: TypeId, name: &str, signature: &str) -> Option<&ExecutableUnit> {
        self.unit_names
            .get(&(type_id, name.to_owned(), signature.to_owned()))
            .and_then(|id| self.unit(*id))
    }

    pub fn field_by_name(&self, type_id: TypeId, name: &str) -> Option<&FieldInfo> {
        self.field_names
            .get(&(type_id, name.to_owned()))
            .and_then(|id| self.field(*id))
    }

    pub fn probe_at(&self, unit: UnitId, index: u32) -> Option<&ProbeInfo> {
        self.probe_index
            .get(&(unit, index))
            .and_then(|id| self.probe(*id))
    }

    pub fn advice_by_name(&self, name: &str) -> Option<&AdviceInfo> {
        self.advice_names
            .get(name)
            .and_then(|id| self.advice(*id))
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeNode> {
        self.types.iter()
    }

    pub fn units(&self) -> impl Iterator<Item = &ExecutableUnit> {
        self.units.iter()
    }

    /// Records that a unit was observed executing, or that it never will.
    pub fn set_has_trace(&mut self, unit: UnitId, has_trace: HasTrace) -> Result<(), CatalogError> {
        self.unit_mut(unit)?.has_trace = has_trace;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trace_wire::{TypeId, UnitId};

    use super::{CatalogError, MonitoringMode, StructureCatalog, TypeDef, UnitDef, UnitKind};

    fn unit(name: &str) -> UnitDef {
        UnitDef {
            name: name.to_owned(),
            signature: "()V".to_owned(),
            probes: vec![0, 4],
            ..UnitDef::default()
        }
    }

    #[test]
    fn placeholder_then_load() {
        let mut catalog = StructureCatalog::default();
        let b = catalog
            .define_type(&TypeDef {
                name: "B".to_owned(),
                super_type: Some("A".to_owned()),
                units: vec![unit("m")],
                fields: vec!["x".to_owned()],
                ..TypeDef::default()
            })
            .unwrap();
        let a = catalog.type_by_name("A").unwrap();
        assert!(!a.loaded);
        let a = a.id;
        assert_eq!(b, TypeId(1));
        assert_eq!(a, TypeId(2));
        assert_eq!(catalog.type_node(b).unwrap().parents().collect::<Vec<_>>(), [a]);

        let loaded = catalog
            .define_type(&TypeDef {
                name: "A".to_owned(),
                units: vec![unit("m")],
                ..TypeDef::default()
            })
            .unwrap();
        assert_eq!(loaded, a);
        assert!(catalog.type_node(a).unwrap().loaded);

        let m = catalog.unit_by_name(b, "m", "()V").unwrap();
        assert_eq!(m.id, UnitId(1));
        assert!(m.is_virtual());
        assert_eq!(catalog.probe_at(m.id, 4).map(|p| p.unit), Some(m.id));
        assert_eq!(catalog.field_by_name(b, "x").map(|f| f.declaring_type), Some(b));
    }

    #[test]
    fn duplicates() {
        let mut catalog = StructureCatalog::default();
        let def = TypeDef {
            name: "A".to_owned(),
            ..TypeDef::default()
        };
        catalog.define_type(&def).unwrap();
        assert_eq!(
            catalog.define_type(&def),
            Err(CatalogError::DuplicateType("A".to_owned()))
        );

        let twice = TypeDef {
            name: "C".to_owned(),
            units: vec![unit("m"), unit("m")],
            ..TypeDef::default()
        };
        assert!(matches!(
            catalog.define_type(&twice),
            Err(CatalogError::DuplicateUnit { .. })
        ));
    }

    #[test]
    fn special_and_initializers() {
        let mut catalog = StructureCatalog::default();
        let t = catalog
            .define_type(&TypeDef {
                name: "T".to_owned(),
                units: vec![
                    UnitDef {
                        special: true,
                        ..unit("s")
                    },
                    UnitDef {
                        kind: UnitKind::Initializer,
                        ..unit("<clinit>")
                    },
                ],
                ..TypeDef::default()
            })
            .unwrap();
        let s = catalog.unit_by_name(t, "s", "()V").unwrap();
        assert_eq!(s.mode, MonitoringMode::Special);
        let init = catalog.unit_by_name(t, "<clinit>", "()V").unwrap();
        assert!(init.is_static && !init.is_virtual());
        assert!(catalog.advice_by_name("log").is_none());
        let advice = catalog.add_advice("log");
        assert_eq!(catalog.add_advice("log"), advice);
        assert_eq!(catalog.advice_by_name("log").map(|a| a.id), Some(advice));
    }
}
