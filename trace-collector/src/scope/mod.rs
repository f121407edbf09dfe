mod filter;
pub use self::filter::ScopeFilter;

mod group;
pub use self::group::{GroupId, Groups, MethodGroup};


use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use trace_wire::{CallMode, ModeChange, TypeId, UnitId};

use crate::catalog::{
    CatalogError, ExecutableUnit, HasTrace, MonitoringMode, StructureCatalog, TypeDef, UnitKind,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("malformed scope rule {0:?}")]
    Filter(String),
    #[error("{unit} cannot be promoted from {from:?} to {to:?}")]
    IllegalPromotion {
        unit: UnitId,
        from: MonitoringMode,
        to: MonitoringMode,
    },
    #[error("calls to {0} are already monitored")]
    CallsMonitored(UnitId),
    #[error("{0} is special, its mode is fixed")]
    Special(UnitId),
    #[error("{0}")]
    Catalog(#[from] CatalogError),
}

/// Keeps monitoring modes consistent over the type hierarchy as it is discovered.
///
/// Every unit belongs to one method group. Units overriding each other end up
/// in the same group, once a monitored unit is in a group, the calls to all
/// units of the group are monitored. Modes only ever go up, every change is
/// queued as a `ModeChange` for the producers.
pub struct ScopeGraph {
    root: TypeId,
    filter: ScopeFilter,
    children: BTreeMap<TypeId, BTreeSet<TypeId>>,
    groups: Groups,
    pending: Vec<ModeChange>,
}

impl ScopeGraph {
    pub fn new(catalog: &mut StructureCatalog, root_type: &str, filter: ScopeFilter) -> Self {
        ScopeGraph {
            root: catalog.type_id(root_type),
            filter,
            children: BTreeMap::new(),
            groups: Groups::default(),
            pending: vec![],
        }
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    pub fn filter(&self) -> &ScopeFilter {
        &self.filter
    }

    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    pub fn group_of(&self, unit: UnitId) -> Option<&MethodGroup> {
        self.groups.get(self.groups.group_of(unit)?)
    }

    /// Defines the type in the catalog and propagates modes over its hierarchy.
    pub fn load_type(
        &mut self,
        catalog: &mut StructureCatalog,
        def: &TypeDef,
    ) -> Result<TypeId, ScopeError> {
        let id = catalog.define_type(def)?;
        self.on_type_loaded(catalog, id)?;
        Ok(id)
    }

    pub fn on_type_loaded(
        &mut self,
        catalog: &mut StructureCatalog,
        type_id: TypeId,
    ) -> Result<(), ScopeError> {
        let node = catalog
            .type_node(type_id)
            .ok_or(CatalogError::UnknownType(type_id))?;
        let parents = node.parents().collect::<Vec<_>>();
        let units = node.units.clone();
        let in_scope = self.filter.in_scope(&node.name);

        for parent in parents {
            self.children.entry(parent).or_default().insert(type_id);
        }

        let hierarchy = self.hierarchy(catalog, type_id);

        for (signature, ids) in self.groups.intersecting(&hierarchy) {
            let mut ids = ids.into_iter();
            let Some(survivor) = ids.next() else {
                continue;
            };
            let mut merged = false;
            for absorbed in ids {
                log::debug!("{signature}: merge {absorbed} into {survivor}");
                self.groups.merge(survivor, absorbed);
                merged = true;
            }
            if merged {
                self.apply_group(catalog, survivor)?;
            }
        }

        for unit in units {
            let info = catalog.unit(unit).ok_or(CatalogError::UnknownUnit(unit))?;
            let key = group_key(info);
            let native = info.native;
            let initializer = info.kind == UnitKind::Initializer;

            let group = match info.is_virtual().then(|| self.groups.find(&key, &hierarchy)) {
                Some(Some(group)) => {
                    self.groups.attach(group, unit, type_id);
                    group
                }
                _ => self.groups.create(&key, unit, type_id),
            };
            if let Some(g) = self.groups.get_mut(group) {
                g.monitored |= in_scope;
                g.unknown |= native;
            }
            if native {
                catalog.set_has_trace(unit, HasTrace::No)?;
            }
            if in_scope {
                self.raise(catalog, unit, MonitoringMode::Full, true)?;
            }
            if initializer {
                self.raise(catalog, unit, MonitoringMode::Envelope, false)?;
            }
            self.apply_group(catalog, group)?;
        }
        Ok(())
    }

    /// The loaded type, its ancestors, its descendants with their ancestors, and the root.
    pub fn hierarchy(&self, catalog: &StructureCatalog, type_id: TypeId) -> BTreeSet<TypeId> {
        let descendants = self.descendants(type_id);
        let mut set = self.ancestors(catalog, descendants.iter().copied().chain([type_id]));
        set.extend(descendants);
        set.insert(type_id);
        set.insert(self.root);
        set
    }

    fn ancestors<I>(&self, catalog: &StructureCatalog, start: I) -> BTreeSet<TypeId>
    where
        I: IntoIterator<Item = TypeId>,
    {
        let mut visited = BTreeSet::new();
        let mut work = start.into_iter().collect::<Vec<_>>();
        while let Some(t) = work.pop() {
            let Some(node) = catalog.type_node(t) else {
                continue;
            };
            for parent in node.parents() {
                if visited.insert(parent) {
                    work.push(parent);
                }
            }
        }
        visited
    }

    fn descendants(&self, type_id: TypeId) -> BTreeSet<TypeId> {
        let mut visited = BTreeSet::new();
        let mut work = vec![type_id];
        while let Some(t) = work.pop() {
            for child in self.children.get(&t).into_iter().flatten() {
                if visited.insert(*child) {
                    work.push(*child);
                }
            }
        }
        visited
    }

    /// Brings every unit of the group up to what the group flags require.
    fn apply_group(
        &mut self,
        catalog: &mut StructureCatalog,
        group: GroupId,
    ) -> Result<(), ScopeError> {
        let Some(g) = self.groups.get(group) else {
            return Ok(());
        };
        let (monitored, unknown) = (g.monitored, g.unknown);
        if !monitored && !unknown {
            return Ok(());
        }
        let mode = if monitored {
            MonitoringMode::Envelope
        } else {
            MonitoringMode::None
        };
        for unit in g.units.clone() {
            self.raise(catalog, unit, mode, true)?;
        }
        Ok(())
    }

    /// Raises the unit to at least `mode`, queues a change if anything moved.
    fn raise(
        &mut self,
        catalog: &mut StructureCatalog,
        unit: UnitId,
        mode: MonitoringMode,
        call_monitored: bool,
    ) -> Result<(), ScopeError> {
        let u = catalog.unit_mut(unit)?;
        if u.mode == MonitoringMode::Special {
            return Ok(());
        }
        let new_mode = u.mode.max(mode);
        let new_call = u.call_monitored || call_monitored;
        if (new_mode, new_call) == (u.mode, u.call_monitored) {
            return Ok(());
        }
        log::debug!(
            "{unit} {:?}/{} -> {new_mode:?}/{new_call}",
            u.mode,
            u.call_monitored
        );
        u.mode = new_mode;
        u.call_monitored = new_call;
        self.pending.push(change(u));
        Ok(())
    }

    /// Explicit promotion, from the outside. A unit promoted to `Full` is a
    /// target of tracing, so its whole group becomes monitored.
    pub fn promote(
        &mut self,
        catalog: &mut StructureCatalog,
        unit: UnitId,
        mode: MonitoringMode,
    ) -> Result<(), ScopeError> {
        let current = catalog.unit(unit).ok_or(CatalogError::UnknownUnit(unit))?.mode;
        if current == MonitoringMode::Special {
            return Err(ScopeError::Special(unit));
        }
        if mode == MonitoringMode::Special || mode <= current {
            return Err(ScopeError::IllegalPromotion {
                unit,
                from: current,
                to: mode,
            });
        }
        let call = mode == MonitoringMode::Full;
        self.raise(catalog, unit, mode, call)?;
        if call {
            if let Some(group) = self.groups.group_of(unit) {
                if let Some(g) = self.groups.get_mut(group) {
                    g.monitored = true;
                }
                self.apply_group(catalog, group)?;
            }
        }
        Ok(())
    }

    /// Calls to the unit become monitored, the only legal call mode promotion.
    pub fn monitor_calls(
        &mut self,
        catalog: &mut StructureCatalog,
        unit: UnitId,
    ) -> Result<(), ScopeError> {
        let u = catalog.unit(unit).ok_or(CatalogError::UnknownUnit(unit))?;
        if u.mode == MonitoringMode::Special {
            return Err(ScopeError::Special(unit));
        }
        if u.call_monitored {
            return Err(ScopeError::CallsMonitored(unit));
        }
        let mode = u.mode;
        self.raise(catalog, unit, mode, true)
    }

    /// Mode changes since the last drain, in the order they happened.
    pub fn drain_changes(&mut self) -> Vec<ModeChange> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Current mode of every unit that is not at the default, for a new producer.
    pub fn snapshot(&self, catalog: &StructureCatalog) -> Vec<ModeChange> {
        catalog
            .units()
            .filter(|u| u.mode != MonitoringMode::Special)
            .filter(|u| u.mode != MonitoringMode::None || u.call_monitored)
            .map(change)
            .collect()
    }

    /// Checks the group partition and that every unit is in the group of its key.
    pub fn check(&self, catalog: &StructureCatalog) -> Result<(), String> {
        self.groups.check()?;
        for unit in catalog.units() {
            let group = self
                .group_of(unit.id)
                .ok_or_else(|| format!("{} has no group", unit.id))?;
            if group.signature != group_key(unit) {
                return Err(format!("{} is in {} of {}", unit.id, group.id, group.signature));
            }
            if !group.types.contains(&unit.declaring_type) {
                return Err(format!("{} misses {}", group.id, unit.declaring_type));
            }
        }
        Ok(())
    }
}

// units not dispatched through the hierarchy never share a group
fn group_key(unit: &ExecutableUnit) -> String {
    if unit.is_virtual() {
        unit.signature_key()
    } else {
        format!("{}::{}", unit.declaring_type, unit.signature_key())
    }
}

fn change(unit: &ExecutableUnit) -> ModeChange {
    ModeChange {
        unit: unit.id,
        instrumentation: unit.mode.instrumentation(),
        call: if unit.call_monitored {
            CallMode::Monitored
        } else {
            CallMode::Unmonitored
        },
    }
}
