//! StoreRegistry — the authoritative registry over a [`Store`].
//!
//! Every call maps to a handful of store reads and conditional writes.
//! Records are JSON; schedule bindings and heartbeats hold the bare
//! machine id so they can be compared in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use armada_core::job::determine_job_state;
use armada_core::{JobState, MachineState, ScheduledUnit, Unit, UnitFile, UnitState, validate_unit_name};
use armada_store::{Condition, KeyValue, PutOptions, Store, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::event::EventStream;
use crate::keys::{KeyRef, KeySpace};
use crate::lease::LeaseManager;
use crate::registry::Registry;

/// Convert any `Display` error into a `RegistryError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| RegistryError::$variant(e.to_string())
    };
}

/// Stored form of `job/<name>/object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnitRecord {
    name: String,
    unit: UnitFile,
    unit_hash: String,
    target_state: JobState,
}

/// Everything under one `job/<name>/` directory.
#[derive(Debug, Default)]
struct JobRecords {
    object: Option<UnitRecord>,
    target_state: Option<JobState>,
    target: Option<String>,
    global_targets: Vec<String>,
}

impl JobRecords {
    fn unit(&self) -> Option<Unit> {
        self.object.as_ref().map(|rec| Unit {
            name: rec.name.clone(),
            unit: rec.unit.clone(),
            target_state: self.target_state.unwrap_or(rec.target_state),
        })
    }

    fn is_global(&self) -> bool {
        self.object
            .as_ref()
            .is_some_and(|rec| Unit::new(&rec.name, rec.unit.clone(), rec.target_state).is_global())
    }
}

/// Registry backed directly by the coordination store.
#[derive(Clone)]
pub struct StoreRegistry {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl StoreRegistry {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn lease_manager(&self) -> LeaseManager {
        LeaseManager::new(self.store(), self.keys.clone())
    }

    /// Events for the whole key space, starting at the current revision.
    pub async fn event_stream(&self) -> RegistryResult<EventStream> {
        EventStream::new(self.store(), self.keys.clone(), self.keys.prefix().to_string()).await
    }

    /// Events for units and schedule bindings only.
    pub async fn job_event_stream(&self) -> RegistryResult<EventStream> {
        EventStream::new(self.store(), self.keys.clone(), self.keys.jobs()).await
    }

    fn collect_jobs(&self, kvs: Vec<KeyValue>) -> BTreeMap<String, JobRecords> {
        let mut jobs: BTreeMap<String, JobRecords> = BTreeMap::new();
        for kv in kvs {
            match self.keys.parse(&kv.key) {
                Some(KeyRef::JobObject(name)) => match serde_json::from_str::<UnitRecord>(&kv.value) {
                    Ok(rec) => jobs.entry(name.to_string()).or_default().object = Some(rec),
                    Err(e) => warn!(key = %kv.key, error = %e, "skipping malformed unit record"),
                },
                Some(KeyRef::JobTargetState(name)) => match serde_json::from_str::<JobState>(&kv.value) {
                    Ok(state) => jobs.entry(name.to_string()).or_default().target_state = Some(state),
                    Err(e) => warn!(key = %kv.key, error = %e, "skipping malformed target state"),
                },
                Some(KeyRef::JobTarget(name)) if !kv.value.is_empty() => {
                    jobs.entry(name.to_string()).or_default().target = Some(kv.value);
                }
                Some(KeyRef::JobGlobalTarget { unit, machine }) => {
                    jobs.entry(unit.to_string())
                        .or_default()
                        .global_targets
                        .push(machine.to_string());
                }
                _ => {}
            }
        }
        jobs
    }

    async fn heartbeat_holders(&self) -> RegistryResult<HashMap<String, String>> {
        let kvs = self.store.list(&self.keys.heartbeats()).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|kv| match self.keys.parse(&kv.key) {
                Some(KeyRef::Heartbeat(name)) => Some((name.to_string(), kv.value)),
                _ => None,
            })
            .collect())
    }

    fn decode_unit_states(&self, kvs: Vec<KeyValue>) -> Vec<UnitState> {
        kvs.into_iter()
            .filter_map(|kv| match serde_json::from_str::<UnitState>(&kv.value) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping malformed unit state");
                    None
                }
            })
            .collect()
    }

    fn build_schedule(
        &self,
        jobs: &BTreeMap<String, JobRecords>,
        heartbeats: &HashMap<String, String>,
        states: &[UnitState],
    ) -> Vec<ScheduledUnit> {
        let entry = |name: &str, target: &str| {
            let observed = states
                .iter()
                .find(|s| s.unit_name == name && s.machine_id == target);
            ScheduledUnit {
                name: name.to_string(),
                target_machine_id: target.to_string(),
                state: determine_job_state(heartbeats.get(name).map(String::as_str), target, observed),
            }
        };

        let mut schedule = Vec::new();
        for (name, rec) in jobs {
            if rec.is_global() {
                let mut targets = rec.global_targets.clone();
                targets.sort();
                schedule.extend(targets.iter().map(|m| entry(name, m)));
            } else if rec.object.is_some() || rec.target.is_some() {
                schedule.push(entry(name, rec.target.as_deref().unwrap_or_default()));
            } else {
                // Leftover global bindings of a destroyed unit.
                schedule.extend(rec.global_targets.iter().map(|m| entry(name, m)));
            }
        }
        schedule
    }

    async fn delete_quietly(&self, key: &str) -> RegistryResult<()> {
        match self.store.delete(key, Condition::None).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Dynamic machine metadata ───────────────────────────────────

    /// Set a metadata key that overrides the machine's advertised value.
    /// An empty value deletes the key.
    pub async fn set_machine_metadata(&self, machine_id: &str, key: &str, value: &str) -> RegistryResult<()> {
        if value.is_empty() {
            return self.delete_machine_metadata(machine_id, key).await;
        }
        self.store
            .put(&self.keys.machine_metadata(machine_id, key), value, PutOptions::new())
            .await?;
        info!(%machine_id, %key, %value, "machine metadata set");
        Ok(())
    }

    pub async fn delete_machine_metadata(&self, machine_id: &str, key: &str) -> RegistryResult<()> {
        self.delete_quietly(&self.keys.machine_metadata(machine_id, key)).await
    }
}

#[async_trait]
impl Registry for StoreRegistry {
    // ── Units ──────────────────────────────────────────────────────

    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        validate_unit_name(&unit.name).map_err(map_err!(Invalid))?;
        let record = UnitRecord {
            name: unit.name.clone(),
            unit: unit.unit.clone(),
            unit_hash: unit.hash(),
            target_state: unit.target_state,
        };
        let object = serde_json::to_string(&record).map_err(map_err!(Fatal))?;
        let create = PutOptions::new().with_condition(Condition::Absent);

        match self.store.put(&self.keys.job_object(&unit.name), &object, create).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(RegistryError::AlreadyExists(unit.name.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let state = serde_json::to_string(&unit.target_state).map_err(map_err!(Fatal))?;
        self.store
            .put(&self.keys.job_target_state(&unit.name), &state, PutOptions::new())
            .await?;
        info!(unit = %unit.name, target = %unit.target_state, "unit created");
        Ok(())
    }

    async fn destroy_unit(&self, name: &str) -> RegistryResult<()> {
        if self.store.get(&self.keys.job_object(name)).await?.is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let dependents = [
            self.keys.unit_state(name),
            self.keys.heartbeat(name),
            self.keys.job_target(name),
            self.keys.job_target_state(name),
        ];
        for key in &dependents {
            if let Err(e) = self.delete_quietly(key).await {
                warn!(unit = %name, %key, error = %e, "failed to remove dependent key");
            }
        }
        if let Err(e) = self.store.delete_prefix(&self.keys.job_global_targets(name)).await {
            warn!(unit = %name, error = %e, "failed to remove global bindings");
        }

        match self.store.delete(&self.keys.job_object(name), Condition::None).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => return Err(RegistryError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.store.delete_prefix(&self.keys.job_dir(name)).await {
            debug!(unit = %name, error = %e, "job directory cleanup failed");
        }
        info!(unit = %name, "unit destroyed");
        Ok(())
    }

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()> {
        let key = self.keys.job_target_state(name);
        let value = serde_json::to_string(&state).map_err(map_err!(Fatal))?;

        let condition = match self.store.get(&key).await? {
            Some(kv) => Condition::Revision(kv.mod_revision),
            None => {
                if self.store.get(&self.keys.job_object(name)).await?.is_none() {
                    return Err(RegistryError::NotFound(name.to_string()));
                }
                Condition::Absent
            }
        };

        match self
            .store
            .put(&key, &value, PutOptions::new().with_condition(condition))
            .await
        {
            Ok(_) => {
                debug!(unit = %name, target = %state, "target state set");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) | Err(StoreError::NotFound(_)) => Err(RegistryError::Conflict(
                format!("target state of {name} changed concurrently"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn units(&self) -> RegistryResult<Vec<Unit>> {
        let kvs = self.store.list(&self.keys.jobs()).await?;
        Ok(self.collect_jobs(kvs).values().filter_map(JobRecords::unit).collect())
    }

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>> {
        let kvs = self.store.list(&self.keys.job_dir(name)).await?;
        Ok(self.collect_jobs(kvs).get(name).and_then(JobRecords::unit))
    }

    // ── Schedule ───────────────────────────────────────────────────

    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        let jobs = self.collect_jobs(self.store.list(&self.keys.jobs()).await?);
        let heartbeats = self.heartbeat_holders().await?;
        let states = self.unit_states().await?;
        Ok(self.build_schedule(&jobs, &heartbeats, &states))
    }

    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>> {
        let jobs = self.collect_jobs(self.store.list(&self.keys.job_dir(name)).await?);
        if jobs.is_empty() {
            return Ok(None);
        }
        let mut heartbeats = HashMap::new();
        if let Some(kv) = self.store.get(&self.keys.heartbeat(name)).await? {
            heartbeats.insert(name.to_string(), kv.value);
        }
        let states = match self.store.get(&self.keys.unit_state(name)).await? {
            Some(kv) => self.decode_unit_states(vec![kv]),
            None => Vec::new(),
        };
        Ok(self.build_schedule(&jobs, &heartbeats, &states).into_iter().next())
    }

    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let kvs = self.store.list(&self.keys.job_dir(name)).await?;
        let jobs = self.collect_jobs(kvs);
        let Some(rec) = jobs.get(name).filter(|r| r.object.is_some()) else {
            return Err(RegistryError::NotFound(name.to_string()));
        };

        let key = if rec.is_global() {
            self.keys.job_global_target(name, machine_id)
        } else {
            self.keys.job_target(name)
        };
        let create = PutOptions::new().with_condition(Condition::Absent);
        match self.store.put(&key, machine_id, create).await {
            Ok(_) => {
                info!(unit = %name, %machine_id, "unit scheduled");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => match self.store.get(&key).await? {
                Some(kv) if kv.value == machine_id => Ok(()),
                Some(kv) => Err(RegistryError::Conflict(format!(
                    "{name} is already scheduled to {}",
                    kv.value
                ))),
                None => Err(RegistryError::Conflict(format!("binding of {name} changed concurrently"))),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let matching = Condition::Value(machine_id.to_string());
        match self.store.delete(&self.keys.job_target(name), matching).await {
            Ok(_) => {
                info!(unit = %name, %machine_id, "unit unscheduled");
                return Ok(());
            }
            Err(StoreError::NotFound(_)) => {}
            Err(StoreError::CompareFailed { .. }) => {
                return Err(RegistryError::Conflict(format!(
                    "{name} is not scheduled to {machine_id}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        match self
            .store
            .delete(&self.keys.job_global_target(name, machine_id), Condition::None)
            .await
        {
            Ok(_) => {
                info!(unit = %name, %machine_id, "global unit unscheduled");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Ownership ──────────────────────────────────────────────────

    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()> {
        let key = self.keys.heartbeat(name);
        let refresh = PutOptions::new()
            .with_ttl(ttl)
            .with_condition(Condition::Value(machine_id.to_string()));

        match self.store.put(&key, machine_id, refresh).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NotFound(_)) => {}
            Err(StoreError::CompareFailed { .. }) => {
                return Err(RegistryError::Conflict(format!("{name} is owned by another machine")));
            }
            Err(e) => return Err(e.into()),
        }

        let claim = PutOptions::new().with_ttl(ttl).with_condition(Condition::Absent);
        match self.store.put(&key, machine_id, claim).await {
            Ok(_) => {
                debug!(unit = %name, %machine_id, "unit heartbeat claimed");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => {
                Err(RegistryError::Conflict(format!("{name} was claimed concurrently")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()> {
        self.delete_quietly(&self.keys.heartbeat(name)).await
    }

    // ── Observed state ─────────────────────────────────────────────

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        let value = serde_json::to_string(state).map_err(map_err!(Fatal))?;
        self.store
            .put(&self.keys.unit_state(name), &value, PutOptions::new().with_ttl(ttl))
            .await?;
        Ok(())
    }

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()> {
        self.delete_quietly(&self.keys.unit_state(name)).await
    }

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        let kvs = self.store.list(&self.keys.unit_states()).await?;
        Ok(self.decode_unit_states(kvs))
    }

    // ── Machines ───────────────────────────────────────────────────

    async fn machines(&self) -> RegistryResult<Vec<MachineState>> {
        let kvs = self.store.list(&self.keys.machines()).await?;
        let mut machines: BTreeMap<String, MachineState> = BTreeMap::new();
        let mut dynamic: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for kv in kvs {
            match self.keys.parse(&kv.key) {
                Some(KeyRef::MachineObject(id)) => match serde_json::from_str::<MachineState>(&kv.value) {
                    Ok(state) => {
                        machines.insert(id.to_string(), state);
                    }
                    Err(e) => warn!(key = %kv.key, error = %e, "skipping malformed machine state"),
                },
                Some(KeyRef::MachineMetadata { machine, key }) => {
                    dynamic
                        .entry(machine.to_string())
                        .or_default()
                        .insert(key.to_string(), kv.value);
                }
                _ => {}
            }
        }

        for (id, md) in &dynamic {
            if let Some(state) = machines.get_mut(id) {
                state.merge_metadata(md);
            }
        }
        Ok(machines.into_values().collect())
    }

    async fn set_machine_state(&self, state: &MachineState, ttl: Duration) -> RegistryResult<u64> {
        let key = self.keys.machine_object(&state.id);
        let value = serde_json::to_string(state).map_err(map_err!(Fatal))?;

        let update = PutOptions::new().with_ttl(ttl).with_condition(Condition::Present);
        match self.store.put(&key, &value, update).await {
            Ok(kv) => return Ok(kv.mod_revision),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let create = PutOptions::new().with_ttl(ttl).with_condition(Condition::Absent);
        match self.store.put(&key, &value, create).await {
            Ok(kv) => {
                info!(machine_id = %state.id, "machine state published");
                Ok(kv.mod_revision)
            }
            Err(StoreError::AlreadyExists(_)) => {
                let kv = self.store.put(&key, &value, PutOptions::new().with_ttl(ttl)).await?;
                Ok(kv.mod_revision)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_machine_state(&self, machine_id: &str) -> RegistryResult<()> {
        self.delete_quietly(&self.keys.machine_object(machine_id)).await?;
        if let Err(e) = self.store.delete_prefix(&self.keys.machine_metadata_dir(machine_id)).await {
            warn!(%machine_id, error = %e, "failed to remove machine metadata");
        }
        info!(%machine_id, "machine state removed");
        Ok(())
    }
}
