//! The per-machine agent: the operations task chains are made of.
//!
//! ```text
//! load   cache=loaded,   subscribe, spool, executor.load, reload
//! start  cache=launched, claim heartbeat, executor.start
//! stop   cache=loaded,   clear heartbeat, executor.stop
//! unload clear heartbeat, forget, executor.stop, unsubscribe, executor.unload, unspool
//! ```
//!
//! Global units run on many machines at once, so they never take the
//! per-unit heartbeat.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use armada_core::{JobState, MachineState, Requirements, Unit};
use armada_registry::{Registry, RegistryError};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::cache::AgentCache;
use crate::error::{AgentError, AgentResult};
use crate::executor::UnitExecutor;
use crate::generator::UnitStateGenerator;
use crate::spool::UnitSpool;

pub const DEFAULT_AGENT_TTL: Duration = Duration::from_secs(30);

/// What the executor currently has for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUnit {
    /// Target state the agent last drove the unit to; `Inactive` when the
    /// executor has it but the agent never did.
    pub state: JobState,
    pub hash: String,
}

/// Whether `machine` satisfies the machine-local directives of `req`.
pub fn runnable_on(req: &Requirements, machine: &MachineState) -> Result<(), String> {
    if let Some(id) = &req.machine_id {
        if !machine.match_id(id) {
            return Err(format!("machine {} does not match required {id}", machine.id));
        }
    }
    if !req.metadata_satisfied_by(&machine.metadata) {
        return Err("local machine metadata insufficient".into());
    }
    Ok(())
}

pub struct Agent {
    registry: Arc<dyn Registry>,
    executor: Arc<dyn UnitExecutor>,
    generator: Arc<UnitStateGenerator>,
    machine: Arc<RwLock<MachineState>>,
    ttl: Duration,
    spool: Option<UnitSpool>,
    cache: Mutex<AgentCache>,
    /// Units this machine held but lost the heartbeat for.
    lost: Mutex<BTreeSet<String>>,
    /// Global units currently handled here.
    globals: Mutex<BTreeSet<String>>,
}

impl Agent {
    pub fn new(
        registry: Arc<dyn Registry>,
        executor: Arc<dyn UnitExecutor>,
        generator: Arc<UnitStateGenerator>,
        machine: Arc<RwLock<MachineState>>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            generator,
            machine,
            ttl,
            spool: None,
            cache: Mutex::new(AgentCache::default()),
            lost: Mutex::new(BTreeSet::new()),
            globals: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_spool(mut self, spool: UnitSpool) -> Self {
        self.spool = Some(spool);
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn machine_id(&self) -> String {
        self.machine.read().await.id.clone()
    }

    pub async fn machine_state(&self) -> MachineState {
        self.machine.read().await.clone()
    }

    pub async fn cache(&self) -> AgentCache {
        self.cache.lock().await.clone()
    }

    pub async fn lost_units(&self) -> BTreeSet<String> {
        self.lost.lock().await.clone()
    }

    /// Forget lost units the executor no longer has, returning the rest.
    pub async fn prune_lost(&self, current: &BTreeMap<String, CurrentUnit>) -> BTreeSet<String> {
        let mut lost = self.lost.lock().await;
        lost.retain(|name| {
            let present = current.contains_key(name);
            if !present {
                debug!(unit = %name, "lost unit already gone from executor");
            }
            present
        });
        lost.clone()
    }

    async fn is_global(&self, name: &str) -> bool {
        self.globals.lock().await.contains(name)
    }

    // ── Task operations ────────────────────────────────────────────

    pub async fn load_unit(&self, unit: &Unit) -> AgentResult<()> {
        self.cache
            .lock()
            .await
            .set_target_state(&unit.name, JobState::Loaded);
        if unit.is_global() {
            self.globals.lock().await.insert(unit.name.clone());
        }
        self.generator.subscribe(&unit.name).await;
        if let Some(spool) = &self.spool {
            spool.write(&unit.name, &unit.unit).await?;
        }
        self.executor.load(&unit.name, &unit.unit).await?;
        self.executor.reload_unit_files().await?;
        Ok(())
    }

    /// The unit file is removed only when the stop succeeded, so a unit
    /// that refuses to stop stays controllable.
    pub async fn unload_unit(&self, name: &str) -> AgentResult<()> {
        // A lost unit's heartbeat belongs to someone else now.
        let lost = self.lost.lock().await.contains(name);
        if !lost && !self.is_global(name).await {
            if let Err(e) = self.registry.clear_unit_heartbeat(name).await {
                debug!(unit = %name, error = %e, "could not clear unit heartbeat");
            }
        }
        self.cache.lock().await.drop_target_state(name);

        let stopped = self.executor.stop(name).await;
        match &stopped {
            Ok(()) => info!(unit = %name, "stopped unit"),
            Err(e) => warn!(unit = %name, error = %e, "stop before unload failed"),
        }
        self.generator.unsubscribe(name).await;
        stopped?;

        self.executor.unload(name).await?;
        self.executor.reload_unit_files().await?;
        if let Some(spool) = &self.spool {
            spool.remove(name).await?;
        }
        self.lost.lock().await.remove(name);
        self.globals.lock().await.remove(name);
        Ok(())
    }

    /// Claims the unit's heartbeat first; refuses when another machine
    /// holds it.
    pub async fn start_unit(&self, name: &str) -> AgentResult<()> {
        self.cache
            .lock()
            .await
            .set_target_state(name, JobState::Launched);

        if !self.is_global(name).await {
            let machine_id = self.machine_id().await;
            match self.registry.unit_heartbeat(name, &machine_id, self.ttl).await {
                Ok(()) => {}
                Err(RegistryError::Conflict(reason)) => {
                    self.cache.lock().await.set_target_state(name, JobState::Loaded);
                    return Err(AgentError::OwnedElsewhere {
                        unit: name.to_string(),
                        reason,
                    });
                }
                Err(e) => warn!(unit = %name, error = %e, "initial unit heartbeat failed"),
            }
        }
        self.executor.start(name).await?;
        Ok(())
    }

    pub async fn stop_unit(&self, name: &str) -> AgentResult<()> {
        self.cache.lock().await.set_target_state(name, JobState::Loaded);
        if !self.is_global(name).await {
            if let Err(e) = self.registry.clear_unit_heartbeat(name).await {
                debug!(unit = %name, error = %e, "could not clear unit heartbeat");
            }
        }
        self.executor.stop(name).await?;
        Ok(())
    }

    // ── Heartbeats ─────────────────────────────────────────────────

    /// Refresh the heartbeat of every launched, non-global unit. Units whose
    /// refresh fails are marked lost.
    pub async fn heartbeat_units(&self) {
        let machine_id = self.machine_id().await;
        let launched = self.cache.lock().await.launched();
        for name in launched {
            if self.is_global(&name).await {
                continue;
            }
            if let Err(e) = self.registry.unit_heartbeat(&name, &machine_id, self.ttl).await {
                error!(unit = %name, error = %e, "unit heartbeat failed, giving the unit up");
                self.lost.lock().await.insert(name);
            }
        }
    }

    /// Heartbeat launched units every TTL/2 until `stop` flips.
    pub async fn run_heartbeats(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ttl / 2);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat_units().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("unit heartbeats exiting on stop signal");
                        return;
                    }
                }
            }
        }
    }

    // ── State ──────────────────────────────────────────────────────

    /// Units the executor has loaded, with the state the agent drove them to.
    pub async fn current_state(&self) -> AgentResult<BTreeMap<String, CurrentUnit>> {
        let names: BTreeSet<String> = self.executor.units().await?.into_iter().collect();
        let states = self.executor.unit_states(&names).await?;
        let cache = self.cache.lock().await;
        Ok(states
            .into_iter()
            .map(|(name, state)| {
                let current = CurrentUnit {
                    state: cache.target_state(&name).unwrap_or(JobState::Inactive),
                    hash: state.unit_hash,
                };
                (name, current)
            })
            .collect())
    }

    /// Units scheduled to this machine that it can still run.
    pub async fn desired_state(&self) -> AgentResult<BTreeMap<String, Unit>> {
        let machine = self.machine_state().await;
        let scheduled_here: BTreeSet<String> = self
            .registry
            .schedule()
            .await?
            .into_iter()
            .filter(|su| su.target_machine_id == machine.id)
            .map(|su| su.name)
            .collect();

        let mut desired = BTreeMap::new();
        for unit in self.registry.units().await? {
            if !scheduled_here.contains(&unit.name) {
                continue;
            }
            if let Err(why) = runnable_on(&unit.requirements(), &machine) {
                debug!(unit = %unit.name, reason = %why, "scheduled here but unable to run");
                continue;
            }
            desired.insert(unit.name.clone(), unit);
        }
        Ok(desired)
    }

    /// Pick up units a previous run left in the executor. Spooled units the
    /// executor still has are adopted; the rest of the spool is dropped.
    pub async fn initialize(&self) -> AgentResult<()> {
        let Some(spool) = &self.spool else {
            return Ok(());
        };
        let loaded: BTreeSet<String> = self.executor.units().await?.into_iter().collect();
        for name in spool.list().await? {
            if !loaded.contains(&name) {
                debug!(unit = %name, "dropping stale spool file");
                spool.remove(&name).await?;
                continue;
            }
            let active = self
                .executor
                .unit_state(&name)
                .await?
                .is_some_and(|s| s.active_state == crate::executor::ACTIVE_ACTIVE);
            let state = if active { JobState::Launched } else { JobState::Loaded };
            self.cache.lock().await.set_target_state(&name, state);
            self.generator.subscribe(&name).await;
            info!(unit = %name, %state, "re-acquired spooled unit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use armada_core::UnitFile;
    use armada_registry::{KeySpace, StoreRegistry};
    use armada_store::MemStore;

    use super::*;
    use crate::executor::{FakeExecutor, FakeOp};

    const TTL: Duration = Duration::from_secs(30);

    struct Harness {
        registry: Arc<StoreRegistry>,
        exec: Arc<FakeExecutor>,
        agent: Agent,
    }

    fn harness(machine_id: &str) -> Harness {
        let registry = Arc::new(StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default()));
        let exec = Arc::new(FakeExecutor::new());
        let generator = Arc::new(UnitStateGenerator::new(exec.clone()));
        let machine = Arc::new(RwLock::new(MachineState::new(machine_id).with_metadata("role", "web")));
        let agent = Agent::new(registry.clone(), exec.clone(), generator, machine, TTL);
        Harness { registry, exec, agent }
    }

    fn unit(name: &str, placement: &str) -> Unit {
        let raw = format!("[Service]\nExecStart=/bin/sleep 3000\n\n[X-Armada]\n{placement}\n");
        Unit::new(name, UnitFile::parse(&raw).unwrap(), JobState::Launched)
    }

    #[tokio::test(start_paused = true)]
    async fn load_start_claims_heartbeat() {
        let h = harness("m1");
        let u = unit("a.service", "");
        h.registry.create_unit(&u).await.unwrap();

        h.agent.load_unit(&u).await.unwrap();
        h.agent.start_unit("a.service").await.unwrap();

        assert!(h.exec.is_active("a.service").await);
        assert_eq!(h.agent.cache().await.launched(), ["a.service"]);
        assert_eq!(h.exec.reloads().await, 1);
        let err = h.registry.unit_heartbeat("a.service", "m2", TTL).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_refuses_foreign_heartbeat() {
        let h = harness("m1");
        let u = unit("a.service", "");
        h.registry.create_unit(&u).await.unwrap();
        h.registry.unit_heartbeat("a.service", "m2", TTL).await.unwrap();

        h.agent.load_unit(&u).await.unwrap();
        let err = h.agent.start_unit("a.service").await.unwrap_err();
        assert!(matches!(err, AgentError::OwnedElsewhere { .. }));
        assert!(!h.exec.is_active("a.service").await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_marks_unit_lost() {
        let h = harness("m1");
        let u = unit("a.service", "");
        h.registry.create_unit(&u).await.unwrap();
        h.agent.load_unit(&u).await.unwrap();
        h.agent.start_unit("a.service").await.unwrap();

        // Another machine takes over once ours expires.
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        h.registry.unit_heartbeat("a.service", "m2", TTL).await.unwrap();

        h.agent.heartbeat_units().await;
        assert!(h.agent.lost_units().await.contains("a.service"));

        h.agent.unload_unit("a.service").await.unwrap();
        assert!(h.agent.lost_units().await.is_empty());
        // The new owner keeps its claim.
        let err = h.registry.unit_heartbeat("a.service", "m1", TTL).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn global_units_skip_heartbeats() {
        let h = harness("m1");
        let u = unit("agent.service", "Global=true");
        h.registry.create_unit(&u).await.unwrap();
        h.registry.unit_heartbeat("agent.service", "m2", TTL).await.unwrap();

        h.agent.load_unit(&u).await.unwrap();
        h.agent.start_unit("agent.service").await.unwrap();
        h.agent.heartbeat_units().await;
        assert!(h.agent.lost_units().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unload_keeps_file_when_stop_fails() {
        let h = harness("m1");
        let u = unit("a.service", "");
        h.agent.load_unit(&u).await.unwrap();
        h.exec.fail_next(FakeOp::Stop, "a.service").await;

        assert!(h.agent.unload_unit("a.service").await.is_err());
        assert_eq!(h.exec.units().await.unwrap(), ["a.service"]);
    }

    #[tokio::test(start_paused = true)]
    async fn desired_state_filters_by_schedule_and_metadata() {
        let h = harness("m1");
        for u in [
            unit("mine.service", ""),
            unit("other.service", ""),
            unit("wrongmeta.service", "MachineMetadata=role=db"),
        ] {
            h.registry.create_unit(&u).await.unwrap();
        }
        h.registry.schedule_unit("mine.service", "m1").await.unwrap();
        h.registry.schedule_unit("other.service", "m2").await.unwrap();
        h.registry.schedule_unit("wrongmeta.service", "m1").await.unwrap();

        let desired = h.agent.desired_state().await.unwrap();
        assert_eq!(desired.keys().collect::<Vec<_>>(), ["mine.service"]);
    }

    #[tokio::test(start_paused = true)]
    async fn current_state_reports_hash_and_cache() {
        let h = harness("m1");
        let u = unit("a.service", "");
        h.agent.load_unit(&u).await.unwrap();
        h.exec.load("stray.service", &u.unit).await.unwrap();

        let current = h.agent.current_state().await.unwrap();
        assert_eq!(current["a.service"].state, JobState::Loaded);
        assert_eq!(current["a.service"].hash, u.hash());
        assert_eq!(current["stray.service"].state, JobState::Inactive);
    }

    #[tokio::test]
    async fn initialize_adopts_spooled_units() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = UnitSpool::open(tmp.path()).await.unwrap();
        let h = harness("m1");
        let u = unit("kept.service", "");
        spool.write("kept.service", &u.unit).await.unwrap();
        spool.write("stale.service", &u.unit).await.unwrap();
        h.exec.load("kept.service", &u.unit).await.unwrap();
        h.exec.start("kept.service").await.unwrap();

        let agent = h.agent.with_spool(spool.clone());
        agent.initialize().await.unwrap();

        assert_eq!(agent.cache().await.launched(), ["kept.service"]);
        assert_eq!(spool.list().await.unwrap(), ["kept.service"]);
    }
}
