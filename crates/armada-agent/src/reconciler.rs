//! Drives the local executor toward the units scheduled here.
//!
//! | desired          | current                 | chain                      |
//! |------------------|-------------------------|----------------------------|
//! | none             | any                     | unload                     |
//! | target inactive  | any                     | unload                     |
//! | loaded/launched  | none                    | load (+ start if launched) |
//! | any              | hash differs            | unload, load (+ start)     |
//! | launched         | loaded or inactive      | (load if inactive), start  |
//! | loaded           | launched                | stop                       |
//! | loaded           | inactive                | load                       |
//! | equal            | equal                   | nothing                    |
//!
//! Units whose heartbeat was lost are unloaded regardless. Once gone from
//! the executor they are treated like any other unit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use armada_core::{JobState, Unit};
use armada_registry::EventStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, CurrentUnit};
use crate::error::{AgentResult, TaskError};
use crate::task::{TaskChain, TaskHandle, TaskKind, TaskManager};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts [`AgentReconciler::purge`] makes before giving up.
const PURGE_ATTEMPTS: u32 = 5;

const REASON_NOT_SCHEDULED: &str = "unit loaded but not scheduled here";
const REASON_UNLOADED: &str = "unit scheduled here but not loaded";
const REASON_HASH_DIFFERS: &str = "unit loaded but hash differs to expected";
const REASON_WANT_LAUNCHED: &str = "unit currently loaded but desired state is launched";
const REASON_WANT_LOADED: &str = "unit currently launched but desired state is loaded";
const REASON_LOST: &str = "unit heartbeat lost to another machine";
const REASON_PURGE: &str = "purging agent";

/// Tasks that take one unit from `current` to `desired`.
pub fn calculate_task_chain(
    name: &str,
    desired: Option<&Unit>,
    current: Option<&CurrentUnit>,
    lost: bool,
) -> Option<TaskChain> {
    let mut chain = TaskChain::new(name, desired.cloned());

    if lost && current.is_some() {
        chain.push(TaskKind::Unload, REASON_LOST);
        return Some(chain);
    }

    let desired = match desired {
        Some(d) if d.target_state != JobState::Inactive => d,
        _ => {
            if current.is_none() {
                if desired.is_none() {
                    error!(unit = %name, "desired and current state both empty");
                }
                return None;
            }
            chain.push(TaskKind::Unload, REASON_NOT_SCHEDULED);
            return Some(chain);
        }
    };

    let launch = desired.target_state == JobState::Launched;
    let Some(current) = current else {
        chain.push(TaskKind::Load, REASON_UNLOADED);
        if launch {
            chain.push(TaskKind::Start, REASON_WANT_LAUNCHED);
        }
        return Some(chain);
    };

    if current.hash != desired.hash() {
        debug!(unit = %name, current = %current.hash, "unit file changed, reloading");
        chain.push(TaskKind::Unload, REASON_HASH_DIFFERS);
        chain.push(TaskKind::Load, REASON_UNLOADED);
        if launch {
            chain.push(TaskKind::Start, REASON_WANT_LAUNCHED);
        }
        return Some(chain);
    }

    if current.state == desired.target_state {
        return None;
    }
    if current.state == JobState::Inactive {
        chain.push(TaskKind::Load, REASON_UNLOADED);
    }
    match (current.state, desired.target_state) {
        (JobState::Inactive | JobState::Loaded, JobState::Launched) => {
            chain.push(TaskKind::Start, REASON_WANT_LAUNCHED);
        }
        (JobState::Launched, JobState::Loaded) => chain.push(TaskKind::Stop, REASON_WANT_LOADED),
        _ => {}
    }
    (!chain.tasks.is_empty()).then_some(chain)
}

/// Chains for every unit in `desired ∪ current`, ordered by name.
pub fn calculate_task_chains(
    desired: &BTreeMap<String, Unit>,
    current: &BTreeMap<String, CurrentUnit>,
    lost: &BTreeSet<String>,
) -> Vec<TaskChain> {
    let names: BTreeSet<&String> = desired.keys().chain(current.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| calculate_task_chain(name, desired.get(name), current.get(name), lost.contains(name)))
        .collect()
}

pub struct AgentReconciler {
    tasks: TaskManager,
    interval: Duration,
}

impl Default for AgentReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentReconciler {
    pub fn new() -> Self {
        Self {
            tasks: TaskManager::new(),
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    /// One pass: compute chains and hand them to the task manager. Busy
    /// units are skipped until the next pass.
    pub async fn reconcile(&self, agent: &Arc<Agent>) -> AgentResult<Vec<TaskHandle>> {
        let desired = agent.desired_state().await?;
        let current = agent.current_state().await?;
        let lost = agent.prune_lost(&current).await;

        let mut handles = Vec::new();
        for chain in calculate_task_chains(&desired, &current, &lost) {
            info!(%chain, "agent task chain");
            match self.tasks.submit(chain, agent.clone()).await {
                Ok(handle) => handles.push(handle),
                Err(TaskError::Busy(unit)) => debug!(%unit, "unit busy, retrying next pass"),
                Err(e) => warn!(error = %e, "task chain rejected"),
            }
        }
        Ok(handles)
    }

    /// Reconcile and wait for every chain launched by the pass.
    pub async fn reconcile_and_wait(&self, agent: &Arc<Agent>) -> AgentResult<()> {
        for handle in self.reconcile(agent).await? {
            handle.log().await;
        }
        Ok(())
    }

    /// Reconcile on every tick and registry event until `stop` flips.
    pub async fn run(&self, agent: Arc<Agent>, events: Option<EventStream>, mut stop: watch::Receiver<bool>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reader = events.map(|mut stream| {
            let mut abort = stop.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.next(&mut abort).await {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            })
        });

        let mut ticker = tokio::time::interval(self.interval);
        info!(interval = ?self.interval, "agent reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.timed_pass(&agent).await,
                Some(event) = event_rx.recv() => {
                    while event_rx.try_recv().is_ok() {}
                    debug!(?event, "agent woken by registry event");
                    self.timed_pass(&agent).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    async fn timed_pass(&self, agent: &Arc<Agent>) {
        let start = Instant::now();
        match self.reconcile(agent).await {
            Ok(handles) => {
                for handle in handles {
                    tokio::spawn(handle.log());
                }
            }
            Err(e) => error!(error = %e, "unable to determine agent state"),
        }
        let elapsed = start.elapsed();
        if elapsed > self.interval {
            warn!(?elapsed, "agent reconcile overran its interval");
        } else {
            debug!(?elapsed, "agent reconcile complete");
        }
    }

    /// Unload everything the executor has.
    pub async fn purge(&self, agent: &Arc<Agent>) {
        for attempt in 1..=PURGE_ATTEMPTS {
            let current = match agent.current_state().await {
                Ok(current) => current,
                Err(e) => {
                    error!(error = %e, "unable to determine agent state for purge");
                    return;
                }
            };
            if current.is_empty() {
                return;
            }
            debug!(attempt, units = current.len(), "purging agent units");
            for name in current.keys() {
                let mut chain = TaskChain::new(name, None);
                chain.push(TaskKind::Unload, REASON_PURGE);
                match self.tasks.submit(chain, agent.clone()).await {
                    Ok(handle) => handle.log().await,
                    Err(e) => debug!(unit = %name, error = %e, "purge deferred"),
                }
            }
            if attempt < PURGE_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        warn!("agent purge gave up with units still loaded");
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{MachineState, UnitFile};
    use armada_registry::{KeySpace, Registry, StoreRegistry};
    use armada_store::MemStore;
    use tokio::sync::RwLock;

    use super::*;
    use crate::executor::{FakeExecutor, UnitExecutor};
    use crate::generator::UnitStateGenerator;

    fn unit(name: &str, target: JobState, exec: &str) -> Unit {
        let raw = format!("[Service]\nExecStart={exec}\n");
        Unit::new(name, UnitFile::parse(&raw).unwrap(), target)
    }

    fn current(state: JobState, unit: &Unit) -> CurrentUnit {
        CurrentUnit {
            state,
            hash: unit.hash(),
        }
    }

    fn kinds(chain: Option<TaskChain>) -> Vec<TaskKind> {
        chain.map(|c| c.kinds()).unwrap_or_default()
    }

    use TaskKind::*;

    #[test]
    fn chain_table() {
        let loaded = unit("a.service", JobState::Loaded, "/bin/true");
        let launched = unit("a.service", JobState::Launched, "/bin/true");
        let inactive = unit("a.service", JobState::Inactive, "/bin/true");
        let cur = |s| current(s, &launched);

        let cases: Vec<(Option<&Unit>, Option<CurrentUnit>, Vec<TaskKind>)> = vec![
            (None, None, vec![]),
            (None, Some(cur(JobState::Loaded)), vec![Unload]),
            (None, Some(cur(JobState::Launched)), vec![Unload]),
            (Some(&inactive), Some(cur(JobState::Launched)), vec![Unload]),
            (Some(&inactive), None, vec![]),
            (Some(&loaded), None, vec![Load]),
            (Some(&launched), None, vec![Load, Start]),
            (Some(&loaded), Some(cur(JobState::Launched)), vec![Stop]),
            (Some(&launched), Some(cur(JobState::Loaded)), vec![Start]),
            (Some(&launched), Some(cur(JobState::Launched)), vec![]),
            (Some(&loaded), Some(cur(JobState::Loaded)), vec![]),
            (Some(&launched), Some(cur(JobState::Inactive)), vec![Load, Start]),
            (Some(&loaded), Some(cur(JobState::Inactive)), vec![Load]),
        ];
        for (i, (d, c, want)) in cases.into_iter().enumerate() {
            let got = kinds(calculate_task_chain("a.service", d, c.as_ref(), false));
            assert_eq!(got, want, "case {i}");
        }
    }

    #[test]
    fn changed_file_is_reloaded() {
        let old = unit("a.service", JobState::Launched, "/bin/sleep 1");
        let new = unit("a.service", JobState::Launched, "/bin/sleep 2");
        let chain = calculate_task_chain("a.service", Some(&new), Some(&current(JobState::Launched, &old)), false);
        assert_eq!(kinds(chain), [Unload, Load, Start]);

        let new = unit("a.service", JobState::Loaded, "/bin/sleep 2");
        let chain = calculate_task_chain("a.service", Some(&new), Some(&current(JobState::Launched, &old)), false);
        assert_eq!(kinds(chain), [Unload, Load]);
    }

    #[test]
    fn lost_units_are_unloaded() {
        let launched = unit("a.service", JobState::Launched, "/bin/true");
        let chain = calculate_task_chain(
            "a.service",
            Some(&launched),
            Some(&current(JobState::Launched, &launched)),
            true,
        );
        assert_eq!(kinds(chain), [Unload]);
        // Already gone: load it again if it is still scheduled here.
        let chain = calculate_task_chain("a.service", Some(&launched), None, true);
        assert_eq!(kinds(chain), [Load, Start]);
        assert!(calculate_task_chain("a.service", None, None, true).is_none());
    }

    #[test]
    fn chains_cover_desired_and_current() {
        let a = unit("a.service", JobState::Launched, "/bin/true");
        let desired = BTreeMap::from([("a.service".to_string(), a.clone())]);
        let current_map = BTreeMap::from([("z.service".to_string(), current(JobState::Loaded, &a))]);
        let chains = calculate_task_chains(&desired, &current_map, &BTreeSet::new());
        let names: Vec<_> = chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a.service", "z.service"]);
    }

    struct Harness {
        registry: Arc<StoreRegistry>,
        exec: Arc<FakeExecutor>,
        agent: Arc<Agent>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default()));
        let exec = Arc::new(FakeExecutor::new());
        let generator = Arc::new(UnitStateGenerator::new(exec.clone()));
        let machine = Arc::new(RwLock::new(MachineState::new("m1")));
        let agent = Arc::new(Agent::new(
            registry.clone(),
            exec.clone(),
            generator,
            machine,
            Duration::from_secs(30),
        ));
        Harness { registry, exec, agent }
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_schedule_changes() {
        let h = harness();
        let rec = AgentReconciler::new();
        let u = unit("sleep.service", JobState::Launched, "/bin/sleep 3000");
        h.registry.create_unit(&u).await.unwrap();
        h.registry.schedule_unit("sleep.service", "m1").await.unwrap();

        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert!(h.exec.is_active("sleep.service").await);
        assert_eq!(h.exec.calls().await, ["load sleep.service", "start sleep.service"]);

        // Nothing to do once converged.
        assert!(rec.reconcile(&h.agent).await.unwrap().is_empty());

        h.registry
            .set_unit_target_state("sleep.service", JobState::Loaded)
            .await
            .unwrap();
        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert!(!h.exec.is_active("sleep.service").await);

        h.registry.unschedule_unit("sleep.service", "m1").await.unwrap();
        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert!(h.exec.units().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_unit_removed_elsewhere_is_reloaded() {
        let h = harness();
        let rec = AgentReconciler::new();
        let u = unit("a.service", JobState::Launched, "/bin/true");
        h.registry.create_unit(&u).await.unwrap();
        h.registry.schedule_unit("a.service", "m1").await.unwrap();
        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert!(h.exec.is_active("a.service").await);

        tokio::time::advance(Duration::from_secs(31)).await;
        h.registry
            .unit_heartbeat("a.service", "m2", Duration::from_secs(30))
            .await
            .unwrap();
        h.agent.heartbeat_units().await;
        assert!(h.agent.lost_units().await.contains("a.service"));

        // The unit disappears without going through unload_unit.
        h.exec.stop("a.service").await.unwrap();
        h.exec.unload("a.service").await.unwrap();
        h.registry.clear_unit_heartbeat("a.service").await.unwrap();

        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert!(h.agent.lost_units().await.is_empty());
        assert!(h.exec.is_active("a.service").await);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_unloads_everything() {
        let h = harness();
        let rec = AgentReconciler::new();
        for name in ["a.service", "b.service"] {
            let u = unit(name, JobState::Launched, "/bin/true");
            h.registry.create_unit(&u).await.unwrap();
            h.registry.schedule_unit(name, "m1").await.unwrap();
        }
        rec.reconcile_and_wait(&h.agent).await.unwrap();
        assert_eq!(h.exec.units().await.unwrap().len(), 2);

        rec.purge(&h.agent).await;
        assert!(h.exec.units().await.unwrap().is_empty());
        assert!(h.agent.cache().await.launched().is_empty());
    }
}
