//! Point-in-time view of the cluster the engine reconciles against.
//!
//! A [`ClusterState`] is built from one registry snapshot and then mutated
//! in place as the reconciler emits decisions, so later placements in the
//! same pass see earlier ones.

use std::collections::{BTreeMap, BTreeSet};

use armada_core::{MachineState, Requirements, ScheduledUnit, Unit, UnitState};
use armada_registry::{Registry, RegistryResult};

#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    units: BTreeMap<String, Unit>,
    requirements: BTreeMap<String, Requirements>,
    machines: BTreeMap<String, MachineState>,
    /// unit name → machines it is bound to.
    bindings: BTreeMap<String, BTreeSet<String>>,
    /// machine id → units bound to it.
    hosted: BTreeMap<String, BTreeSet<String>>,
    states: Vec<UnitState>,
}

impl ClusterState {
    pub fn new(
        units: Vec<Unit>,
        schedule: &[ScheduledUnit],
        machines: Vec<MachineState>,
        states: Vec<UnitState>,
    ) -> Self {
        let mut cluster = Self {
            requirements: units.iter().map(|u| (u.name.clone(), u.requirements())).collect(),
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
            machines: machines.into_iter().map(|m| (m.id.clone(), m)).collect(),
            states,
            ..Self::default()
        };
        for su in schedule.iter().filter(|su| su.is_scheduled()) {
            cluster.bind(&su.name, &su.target_machine_id);
        }
        cluster
    }

    /// Read units, schedule, machines and unit states from `registry`.
    pub async fn snapshot(registry: &dyn Registry) -> RegistryResult<Self> {
        let units = registry.units().await?;
        let schedule = registry.schedule().await?;
        let machines = registry.machines().await?;
        let states = registry.unit_states().await?;
        Ok(Self::new(units, &schedule, machines, states))
    }

    // ── Units ──────────────────────────────────────────────────────

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    /// Placement directives of a known unit.
    pub fn requirements(&self, name: &str) -> Option<&Requirements> {
        self.requirements.get(name)
    }

    pub fn unit_states(&self) -> &[UnitState] {
        &self.states
    }

    // ── Machines ───────────────────────────────────────────────────

    pub fn machines(&self) -> impl Iterator<Item = &MachineState> {
        self.machines.values()
    }

    pub fn machine(&self, id: &str) -> Option<&MachineState> {
        self.machines.get(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.machines.contains_key(id)
    }

    // ── Bindings ───────────────────────────────────────────────────

    /// Every (unit, machine) binding, ordered by unit then machine.
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.bindings
            .iter()
            .flat_map(|(name, machines)| machines.iter().map(move |m| (name.clone(), m.clone())))
            .collect()
    }

    pub fn targets(&self, name: &str) -> impl Iterator<Item = &str> {
        self.bindings.get(name).into_iter().flatten().map(String::as_str)
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.bindings.get(name).is_some_and(|m| !m.is_empty())
    }

    pub fn is_bound_to(&self, name: &str, machine_id: &str) -> bool {
        self.bindings.get(name).is_some_and(|m| m.contains(machine_id))
    }

    /// Units currently bound to `machine_id`.
    pub fn hosted_on(&self, machine_id: &str) -> impl Iterator<Item = &str> {
        self.hosted.get(machine_id).into_iter().flatten().map(String::as_str)
    }

    /// Number of units bound to `machine_id`.
    pub fn load(&self, machine_id: &str) -> usize {
        self.hosted.get(machine_id).map_or(0, BTreeSet::len)
    }

    pub fn bind(&mut self, name: &str, machine_id: &str) {
        self.bindings
            .entry(name.to_string())
            .or_default()
            .insert(machine_id.to_string());
        self.hosted
            .entry(machine_id.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub fn unbind(&mut self, name: &str, machine_id: &str) {
        if let Some(machines) = self.bindings.get_mut(name) {
            machines.remove(machine_id);
            if machines.is_empty() {
                self.bindings.remove(name);
            }
        }
        if let Some(units) = self.hosted.get_mut(machine_id) {
            units.remove(name);
            if units.is_empty() {
                self.hosted.remove(machine_id);
            }
        }
    }

    /// Schedule entries in the shape `Registry::schedule` returns them.
    pub fn schedule(&self) -> Vec<ScheduledUnit> {
        let mut schedule = Vec::new();
        let names: BTreeSet<&String> = self.units.keys().chain(self.bindings.keys()).collect();
        for name in names {
            match self.bindings.get(name.as_str()) {
                Some(machines) => schedule.extend(machines.iter().map(|m| ScheduledUnit {
                    name: name.clone(),
                    target_machine_id: m.clone(),
                    state: Default::default(),
                })),
                None if self.requirements.get(name.as_str()).is_some_and(|r| r.global) => {}
                None => schedule.push(ScheduledUnit {
                    name: name.clone(),
                    target_machine_id: String::new(),
                    state: Default::default(),
                }),
            }
        }
        schedule
    }
}
