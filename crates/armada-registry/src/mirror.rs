//! In-memory registry held by the engine leader.
//!
//! Serves the RPC fast path. It is loaded from the store when leadership
//! is acquired, re-synced from every engine snapshot, and dropped when
//! leadership is lost. TTL entries use `tokio::time::Instant`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use armada_core::job::determine_job_state;
use armada_core::{JobState, MachineState, ScheduledUnit, Unit, UnitState, validate_unit_name};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

/// A value that disappears at `expires_at`.
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self, now: Instant) -> Option<&T> {
        (self.expires_at > now).then_some(&self.value)
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    units: BTreeMap<String, Unit>,
    /// unit name → bound machines; at most one for non-global units.
    bindings: BTreeMap<String, BTreeSet<String>>,
    heartbeats: HashMap<String, Expiring<String>>,
    states: BTreeMap<String, Expiring<UnitState>>,
    machines: BTreeMap<String, Expiring<MachineState>>,
    revision: u64,
}

impl MirrorState {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn is_global(&self, name: &str) -> bool {
        self.units.get(name).is_some_and(Unit::is_global)
    }

    fn schedule(&self, now: Instant) -> Vec<ScheduledUnit> {
        let entry = |name: &str, target: &str| {
            let observed = self
                .states
                .get(name)
                .and_then(|s| s.live(now))
                .filter(|s| s.machine_id == target);
            let holder = self.heartbeats.get(name).and_then(|h| h.live(now));
            ScheduledUnit {
                name: name.to_string(),
                target_machine_id: target.to_string(),
                state: determine_job_state(holder.map(String::as_str), target, observed),
            }
        };

        let names: BTreeSet<&String> = self.units.keys().chain(self.bindings.keys()).collect();
        let mut schedule = Vec::new();
        for name in names {
            let bound = self.bindings.get(name.as_str());
            match bound {
                Some(machines) if !machines.is_empty() => {
                    schedule.extend(machines.iter().map(|m| entry(name, m)));
                }
                _ if self.is_global(name) => {}
                _ => schedule.push(entry(name, "")),
            }
        }
        schedule
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: RwLock<MirrorState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from an authoritative registry. Loaded heartbeats and
    /// states get `ttl` since their remaining lifetime is unknown.
    pub async fn load_from(&self, source: &dyn Registry, ttl: Duration) -> RegistryResult<()> {
        let units = source.units().await?;
        let schedule = source.schedule().await?;
        let states = source.unit_states().await?;

        let mut guard = self.state.write().await;
        guard.units = units.into_iter().map(|u| (u.name.clone(), u)).collect();
        guard.bindings = bindings_of(&schedule);
        guard.heartbeats = schedule
            .iter()
            .filter(|su| su.state == JobState::Launched)
            .map(|su| (su.name.clone(), Expiring::new(su.target_machine_id.clone(), ttl)))
            .collect();
        guard.states = states
            .into_iter()
            .map(|s| (s.unit_name.clone(), Expiring::new(s, ttl)))
            .collect();
        guard.bump();
        debug!(units = guard.units.len(), "mirror loaded");
        Ok(())
    }

    /// Replace units and bindings with a fresh snapshot, keeping
    /// heartbeats and states.
    pub async fn sync_units(&self, units: Vec<Unit>, schedule: &[ScheduledUnit]) {
        let mut guard = self.state.write().await;
        guard.units = units.into_iter().map(|u| (u.name.clone(), u)).collect();
        guard.bindings = bindings_of(schedule);
        guard.bump();
    }

    /// Drop everything; called when leadership is lost.
    pub async fn clear(&self) {
        *self.state.write().await = MirrorState::default();
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.units.is_empty()
    }
}

fn bindings_of(schedule: &[ScheduledUnit]) -> BTreeMap<String, BTreeSet<String>> {
    let mut bindings: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for su in schedule.iter().filter(|su| su.is_scheduled()) {
        bindings
            .entry(su.name.clone())
            .or_default()
            .insert(su.target_machine_id.clone());
    }
    bindings
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        validate_unit_name(&unit.name).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        let mut guard = self.state.write().await;
        if guard.units.contains_key(&unit.name) {
            return Err(RegistryError::AlreadyExists(unit.name.clone()));
        }
        guard.units.insert(unit.name.clone(), unit.clone());
        guard.bump();
        Ok(())
    }

    async fn destroy_unit(&self, name: &str) -> RegistryResult<()> {
        let mut guard = self.state.write().await;
        if guard.units.remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        guard.bindings.remove(name);
        guard.heartbeats.remove(name);
        guard.states.remove(name);
        guard.bump();
        Ok(())
    }

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()> {
        let mut guard = self.state.write().await;
        let unit = guard
            .units
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        unit.target_state = state;
        guard.bump();
        Ok(())
    }

    async fn units(&self) -> RegistryResult<Vec<Unit>> {
        Ok(self.state.read().await.units.values().cloned().collect())
    }

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>> {
        Ok(self.state.read().await.units.get(name).cloned())
    }

    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        Ok(self.state.read().await.schedule(Instant::now()))
    }

    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>> {
        let schedule = self.state.read().await.schedule(Instant::now());
        Ok(schedule.into_iter().find(|su| su.name == name))
    }

    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let mut guard = self.state.write().await;
        if !guard.units.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let global = guard.is_global(name);
        let bound = guard.bindings.entry(name.to_string()).or_default();
        if !global {
            if let Some(other) = bound.iter().find(|m| *m != machine_id) {
                return Err(RegistryError::Conflict(format!("{name} is already scheduled to {other}")));
            }
        }
        bound.insert(machine_id.to_string());
        guard.bump();
        Ok(())
    }

    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let mut guard = self.state.write().await;
        let global = guard.is_global(name);
        if let Some(bound) = guard.bindings.get_mut(name) {
            if !global && !bound.is_empty() && !bound.contains(machine_id) {
                return Err(RegistryError::Conflict(format!("{name} is not scheduled to {machine_id}")));
            }
            bound.remove(machine_id);
            if bound.is_empty() {
                guard.bindings.remove(name);
            }
            guard.bump();
        }
        Ok(())
    }

    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()> {
        let now = Instant::now();
        let mut guard = self.state.write().await;
        if let Some(holder) = guard.heartbeats.get(name).and_then(|h| h.live(now)) {
            if holder != machine_id {
                return Err(RegistryError::Conflict(format!("{name} is owned by {holder}")));
            }
        }
        guard
            .heartbeats
            .insert(name.to_string(), Expiring::new(machine_id.to_string(), ttl));
        Ok(())
    }

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()> {
        self.state.write().await.heartbeats.remove(name);
        Ok(())
    }

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        self.state
            .write()
            .await
            .states
            .insert(name.to_string(), Expiring::new(state.clone(), ttl));
        Ok(())
    }

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()> {
        self.state.write().await.states.remove(name);
        Ok(())
    }

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        let now = Instant::now();
        let guard = self.state.read().await;
        Ok(guard.states.values().filter_map(|s| s.live(now).cloned()).collect())
    }

    async fn machines(&self) -> RegistryResult<Vec<MachineState>> {
        let now = Instant::now();
        let guard = self.state.read().await;
        Ok(guard.machines.values().filter_map(|m| m.live(now).cloned()).collect())
    }

    async fn set_machine_state(&self, state: &MachineState, ttl: Duration) -> RegistryResult<u64> {
        let mut guard = self.state.write().await;
        guard
            .machines
            .insert(state.id.clone(), Expiring::new(state.clone(), ttl));
        Ok(guard.bump())
    }

    async fn remove_machine_state(&self, machine_id: &str) -> RegistryResult<()> {
        self.state.write().await.machines.remove(machine_id);
        Ok(())
    }
}
