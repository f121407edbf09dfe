use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::Serialize;
use trace_wire::{TypeId, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group_{}", self.0)
    }
}

/// Units of one signature that override each other within a connected
/// part of the type hierarchy. Types are the declaring types of the units.
#[derive(Debug, Clone, Serialize)]
pub struct MethodGroup {
    pub id: GroupId,
    pub signature: String,
    pub units: Vec<UnitId>,
    pub types: BTreeSet<TypeId>,
    pub monitored: bool,
    pub unknown: bool,
}

/// All method groups, indexed by signature, by type and by unit.
#[derive(Default)]
pub struct Groups {
    next: u32,
    groups: BTreeMap<GroupId, MethodGroup>,
    by_signature: BTreeMap<String, BTreeSet<GroupId>>,
    by_type: BTreeMap<TypeId, BTreeSet<GroupId>>,
    by_unit: BTreeMap<UnitId, GroupId>,
}

impl Groups {
    pub fn create(&mut self, signature: &str, unit: UnitId, type_id: TypeId) -> GroupId {
        self.next += 1;
        let id = GroupId(self.next);
        self.groups.insert(
            id,
            MethodGroup {
                id,
                signature: signature.to_owned(),
                units: vec![unit],
                types: BTreeSet::from([type_id]),
                monitored: false,
                unknown: false,
            },
        );
        self.by_signature
            .entry(signature.to_owned())
            .or_default()
            .insert(id);
        self.by_type.entry(type_id).or_default().insert(id);
        self.by_unit.insert(unit, id);
        id
    }

    pub fn attach(&mut self, id: GroupId, unit: UnitId, type_id: TypeId) {
        if let Some(group) = self.groups.get_mut(&id) {
            group.units.push(unit);
            group.types.insert(type_id);
            self.by_type.entry(type_id).or_default().insert(id);
            self.by_unit.insert(unit, id);
        }
    }

    /// Moves everything of `from` into `into` and discards `from`.
    /// Returns whether the flags of `into` changed.
    pub fn merge(&mut self, into: GroupId, from: GroupId) -> bool {
        if into == from {
            return false;
        }
        let Some(absorbed) = self.groups.remove(&from) else {
            return false;
        };
        if let Some(ids) = self.by_signature.get_mut(&absorbed.signature) {
            ids.remove(&from);
        }
        for t in &absorbed.types {
            if let Some(ids) = self.by_type.get_mut(t) {
                ids.remove(&from);
                ids.insert(into);
            }
        }
        for unit in &absorbed.units {
            self.by_unit.insert(*unit, into);
        }
        let Some(group) = self.groups.get_mut(&into) else {
            log::error!("merge into missing {into}");
            return false;
        };
        let before = (group.monitored, group.unknown);
        group.units.extend(absorbed.units);
        group.types.extend(absorbed.types);
        group.monitored |= absorbed.monitored;
        group.unknown |= absorbed.unknown;
        before != (group.monitored, group.unknown)
    }

    /// Groups having at least one of the types, by signature.
    pub fn intersecting(&self, types: &BTreeSet<TypeId>) -> BTreeMap<String, BTreeSet<GroupId>> {
        let mut out = BTreeMap::<String, BTreeSet<GroupId>>::new();
        for t in types {
            for id in self.by_type.get(t).into_iter().flatten() {
                if let Some(group) = self.groups.get(id) {
                    out.entry(group.signature.clone()).or_default().insert(*id);
                }
            }
        }
        out
    }

    pub fn find(&self, signature: &str, types: &BTreeSet<TypeId>) -> Option<GroupId> {
        self.by_signature
            .get(signature)?
            .iter()
            .find(|id| {
                self.groups
                    .get(id)
                    .map_or(false, |g| !g.types.is_disjoint(types))
            })
            .copied()
    }

    pub fn get(&self, id: GroupId) -> Option<&MethodGroup> {
        self.groups.get(&id)
    }

    pub fn get_mut(&mut self, id: GroupId) -> Option<&mut MethodGroup> {
        self.groups.get_mut(&id)
    }

    pub fn group_of(&self, unit: UnitId) -> Option<GroupId> {
        self.by_unit.get(&unit).copied()
    }

    pub fn signature_group(&self, signature: &str) -> impl Iterator<Item = &MethodGroup> {
        self.by_signature
            .get(signature)
            .into_iter()
            .flatten()
            .filter_map(|id| self.groups.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MethodGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups of one signature never share a type, and the indices agree with the groups.
    pub fn check(&self) -> Result<(), String> {
        for (signature, ids) in &self.by_signature {
            let mut seen = BTreeMap::new();
            for id in ids {
                let group = self
                    .groups
                    .get(id)
                    .ok_or_else(|| format!("{signature} lists missing {id}"))?;
                if group.signature != *signature {
                    return Err(format!("{id} is {} but listed under {signature}", group.signature));
                }
                for t in &group.types {
                    if let Some(other) = seen.insert(*t, *id) {
                        return Err(format!("{signature}: {other} and {id} share {t}"));
                    }
                }
            }
        }
        for group in self.groups.values() {
            for unit in &group.units {
                if self.by_unit.get(unit) != Some(&group.id) {
                    return Err(format!("{unit} is not indexed to {}", group.id));
                }
            }
            for t in &group.types {
                if !self.by_type.get(t).map_or(false, |ids| ids.contains(&group.id)) {
                    return Err(format!("{t} is not indexed to {}", group.id));
                }
            }
            let listed = self
                .by_signature
                .get(&group.signature)
                .map_or(false, |ids| ids.contains(&group.id));
            if !listed {
                return Err(format!("{} missing from its signature", group.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use trace_wire::{TypeId, UnitId};

    use super::Groups;

    #[test]
    fn merge_unions() {
        let mut groups = Groups::default();
        let a = groups.create("m()V", UnitId(1), TypeId(1));
        let b = groups.create("m()V", UnitId(2), TypeId(2));
        groups.get_mut(b).unwrap().monitored = true;
        assert!(groups.merge(a, b));
        groups.check().unwrap();

        let merged = groups.get(a).unwrap();
        assert!(merged.monitored);
        assert_eq!(merged.units, [UnitId(1), UnitId(2)]);
        assert_eq!(groups.group_of(UnitId(2)), Some(a));
        assert!(groups.get(b).is_none());
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups.find("m()V", &BTreeSet::from([TypeId(2)])),
            Some(a)
        );
        assert_eq!(groups.find("n()V", &BTreeSet::from([TypeId(2)])), None);
    }

    #[test]
    fn check_detects_shared_type() {
        let mut groups = Groups::default();
        let a = groups.create("m()V", UnitId(1), TypeId(1));
        groups.create("m()V", UnitId(2), TypeId(2));
        groups.attach(a, UnitId(3), TypeId(2));
        assert!(groups.check().is_err());
    }
}
