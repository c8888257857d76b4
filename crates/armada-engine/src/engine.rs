//! Leader-elected engine loop.
//!
//! ```text
//!            acquire ok                 renew fails / guard fails
//! Follower ───────────► Leader ─────────────────────────────► Follower
//!    ▲   └─ CandidateAcquire ─┘            │
//!    └──────── acquire lost ───────────────┘ shutdown ─► Stopped (lease released)
//! ```
//!
//! Every tick the engine makes sure of its lease, publishes the current
//! leader id, and, while leading, reconciles. Registry events trigger an
//! extra reconcile between ticks.

use std::sync::Arc;
use std::time::Duration;

use armada_core::MachineState;
use armada_registry::{
    ENGINE_LEASE, EventStream, InMemoryRegistry, Lease, LeaseManager, Registry, RegistryError,
    RegistryResult,
};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterState;
use crate::error::{EngineError, EngineResult};
use crate::reconciler::{EngineTask, TaskKind, calculate_tasks};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Lease TTL as a multiple of the reconcile interval.
const LEASE_TTL_FACTOR: u32 = 5;

/// Renew attempts inside one TTL/3 window.
const RENEW_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Follower,
    CandidateAcquire,
    Leader,
    Stopped,
}

pub struct Engine {
    registry: Arc<dyn Registry>,
    leases: LeaseManager,
    machine: Arc<RwLock<MachineState>>,
    interval: Duration,
    version: String,
    mirror: Option<Arc<InMemoryRegistry>>,
    state: EngineState,
    lease: Option<Lease>,
    renewed_at: Instant,
    leader_tx: watch::Sender<Option<String>>,
}

impl Engine {
    pub fn new(
        registry: Arc<dyn Registry>,
        leases: LeaseManager,
        machine: Arc<RwLock<MachineState>>,
        interval: Duration,
    ) -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            registry,
            leases,
            machine,
            interval,
            version: env!("CARGO_PKG_VERSION").to_string(),
            mirror: None,
            state: EngineState::Follower,
            lease: None,
            renewed_at: Instant::now(),
            leader_tx,
        }
    }

    /// Keep `mirror` in step with every snapshot and applied decision
    /// while leading.
    pub fn with_mirror(mut self, mirror: Arc<InMemoryRegistry>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.interval * LEASE_TTL_FACTOR
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == EngineState::Leader
    }

    /// Current engine leader id, as last observed.
    pub fn leader(&self) -> watch::Receiver<Option<String>> {
        self.leader_tx.subscribe()
    }

    // ── Main loop ──────────────────────────────────────────────────

    /// Run until `shutdown` flips, then release leadership.
    pub async fn run(mut self, events: Option<EventStream>, mut shutdown: watch::Receiver<bool>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let reader = events.map(|mut stream| {
            let mut abort = shutdown.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.next(&mut abort).await {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            })
        });

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, lease_ttl = ?self.lease_ttl(), "engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some(event) = event_rx.recv() => {
                    // Coalesce a burst into one reconcile.
                    let mut burst = 1;
                    while event_rx.try_recv().is_ok() {
                        burst += 1;
                    }
                    debug!(?event, burst, "engine woken by registry event");
                    if self.is_leader() {
                        self.reconcile_and_handle().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop().await;
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    /// One leadership check plus, when leading, one reconcile.
    pub async fn tick(&mut self) {
        self.ensure_leadership().await;
        self.publish_leader().await;
        if self.is_leader() {
            self.reconcile_and_handle().await;
        }
    }

    async fn reconcile_and_handle(&mut self) {
        let deadline = self.lease_ttl();
        let result = match tokio::time::timeout(deadline, self.reconcile()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DeadlineExceeded(deadline)),
        };
        match result {
            Ok(_) => {}
            Err(e @ EngineError::LeadershipLost(_)) => {
                warn!(error = %e, "stepping down");
                self.step_down().await;
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal registry error, releasing engine lease");
                self.release().await;
                self.step_down().await;
            }
            Err(e) => warn!(error = %e, "engine reconcile failed"),
        }
    }

    // ── Leadership ─────────────────────────────────────────────────

    async fn ensure_leadership(&mut self) {
        let ttl = self.lease_ttl();
        if let Some(lease) = self.lease.clone() {
            if self.renewed_at.elapsed() < ttl / 2 {
                return;
            }
            match self.renew(&lease).await {
                Ok(renewed) => {
                    debug!(revision = renewed.revision, "engine lease renewed");
                    self.lease = Some(renewed);
                    self.renewed_at = Instant::now();
                }
                Err(e) => {
                    warn!(error = %e, "engine lease renewal failed");
                    self.step_down().await;
                }
            }
            return;
        }

        self.state = EngineState::CandidateAcquire;
        let machine_id = self.machine.read().await.id.clone();
        match self.leases.acquire(ENGINE_LEASE, &machine_id, &self.version, ttl).await {
            Ok(Some(lease)) => {
                info!(%machine_id, revision = lease.revision, "acquired engine leadership");
                self.lease = Some(lease);
                self.renewed_at = Instant::now();
                self.state = EngineState::Leader;
            }
            Ok(None) => self.state = EngineState::Follower,
            Err(e) => {
                warn!(error = %e, "engine lease acquisition failed");
                self.state = EngineState::Follower;
            }
        }
    }

    /// Renew, retrying transient failures inside a TTL/3 window. A lease
    /// that moved is not retried.
    async fn renew(&self, lease: &Lease) -> RegistryResult<Lease> {
        let ttl = self.lease_ttl();
        let window = ttl / 3;
        let spacing = window / RENEW_ATTEMPTS;
        let deadline = Instant::now() + window;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.leases.renew(lease, ttl).await {
                Ok(renewed) => return Ok(renewed),
                Err(e @ RegistryError::Precondition(_)) => return Err(e),
                Err(e) if attempt >= RENEW_ATTEMPTS || Instant::now() + spacing >= deadline => {
                    return Err(e);
                }
                Err(e) => {
                    debug!(error = %e, attempt, "retrying engine lease renewal");
                    tokio::time::sleep(spacing).await;
                }
            }
        }
    }

    async fn publish_leader(&self) {
        let leader = match &self.lease {
            Some(lease) => Some(lease.holder.clone()),
            None => match self.leases.get(ENGINE_LEASE).await {
                Ok(lease) => lease.map(|l| l.holder),
                Err(e) => {
                    debug!(error = %e, "could not read engine lease");
                    return;
                }
            },
        };
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            info!(leader = ?leader, "engine leader changed");
            *current = leader;
            true
        });
    }

    async fn step_down(&mut self) {
        self.lease = None;
        self.state = EngineState::Follower;
        if let Some(mirror) = &self.mirror {
            mirror.clear().await;
        }
        self.leader_tx.send_replace(None);
    }

    async fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            match self.leases.release(&lease).await {
                Ok(()) => info!("released engine lease"),
                Err(e) => warn!(error = %e, "engine lease release failed"),
            }
        }
    }

    /// Release the lease if held and stop for good.
    pub async fn stop(&mut self) {
        self.release().await;
        self.step_down().await;
        self.state = EngineState::Stopped;
        info!("engine stopped");
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Snapshot, decide, and apply. Decisions are applied only if the
    /// lease still carries the revision this engine holds.
    pub async fn reconcile(&mut self) -> EngineResult<Vec<EngineTask>> {
        let start = Instant::now();
        let mut cluster = ClusterState::snapshot(self.registry.as_ref()).await?;
        if let Some(mirror) = &self.mirror {
            mirror
                .sync_units(cluster.units().cloned().collect(), &cluster.schedule())
                .await;
        }

        let tasks = calculate_tasks(&mut cluster);
        if !tasks.is_empty() {
            self.guard_lease().await?;
            for task in &tasks {
                self.apply(task).await?;
            }
        }

        let elapsed = start.elapsed();
        if elapsed > self.interval {
            warn!(?elapsed, interval = ?self.interval, "engine reconcile overran its interval");
        } else {
            debug!(?elapsed, tasks = tasks.len(), "engine reconcile complete");
        }
        Ok(tasks)
    }

    async fn guard_lease(&self) -> EngineResult<()> {
        let held = self
            .lease
            .as_ref()
            .ok_or_else(|| EngineError::LeadershipLost("no lease held".into()))?;
        match self.leases.get(ENGINE_LEASE).await? {
            Some(current) if current.holder == held.holder && current.revision == held.revision => Ok(()),
            Some(current) => Err(EngineError::LeadershipLost(format!(
                "lease held by {} at revision {}",
                current.holder, current.revision
            ))),
            None => Err(EngineError::LeadershipLost("lease expired".into())),
        }
    }

    /// Conflicts and missing units are left for the next reconcile.
    async fn apply(&self, task: &EngineTask) -> EngineResult<()> {
        let result = match task.kind {
            TaskKind::Schedule => self.registry.schedule_unit(&task.unit, &task.machine_id).await,
            TaskKind::Unschedule => self.registry.unschedule_unit(&task.unit, &task.machine_id).await,
        };
        match result {
            Ok(()) => {
                info!(%task, "engine task applied");
                if let Some(mirror) = &self.mirror {
                    let mirrored = match task.kind {
                        TaskKind::Schedule => mirror.schedule_unit(&task.unit, &task.machine_id).await,
                        TaskKind::Unschedule => mirror.unschedule_unit(&task.unit, &task.machine_id).await,
                    };
                    if let Err(e) = mirrored {
                        debug!(%task, error = %e, "mirror update skipped");
                    }
                }
                Ok(())
            }
            Err(e @ RegistryError::Fatal(_)) => Err(e.into()),
            Err(e) => {
                warn!(%task, error = %e, "engine task failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{JobState, Unit, UnitFile};
    use armada_registry::{KeySpace, StoreRegistry};
    use armada_store::MemStore;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(2);

    struct Harness {
        registry: Arc<StoreRegistry>,
    }

    impl Harness {
        async fn new(machines: &[&str]) -> Self {
            let registry = Arc::new(StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default()));
            for id in machines {
                registry
                    .set_machine_state(&MachineState::new(id), Duration::from_secs(60))
                    .await
                    .unwrap();
            }
            Self { registry }
        }

        fn engine(&self, machine_id: &str) -> Engine {
            Engine::new(
                self.registry.clone(),
                self.registry.lease_manager(),
                Arc::new(RwLock::new(MachineState::new(machine_id))),
                INTERVAL,
            )
        }

        async fn submit(&self, name: &str, target: JobState) {
            let file = UnitFile::parse("[Service]\nExecStart=/bin/sleep 3000\n").unwrap();
            self.registry.create_unit(&Unit::new(name, file, target)).await.unwrap();
        }

        async fn target_of(&self, name: &str) -> String {
            self.registry
                .scheduled_unit(name)
                .await
                .unwrap()
                .map(|su| su.target_machine_id)
                .unwrap_or_default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_engine_leads_and_schedules() {
        let h = Harness::new(&["m1", "m2"]).await;
        h.submit("sleep.service", JobState::Launched).await;

        let mut engine = h.engine("m1");
        let leader = engine.leader();
        engine.tick().await;

        assert_eq!(engine.state(), EngineState::Leader);
        assert_eq!(leader.borrow().as_deref(), Some("m1"));
        assert_eq!(h.target_of("sleep.service").await, "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn second_engine_follows() {
        let h = Harness::new(&["m1", "m2"]).await;
        let mut first = h.engine("m1");
        let mut second = h.engine("m2");

        first.tick().await;
        second.tick().await;

        assert!(first.is_leader());
        assert_eq!(second.state(), EngineState::Follower);
        assert_eq!(second.leader().borrow().as_deref(), Some("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn leader_renews_before_expiry() {
        let h = Harness::new(&["m1"]).await;
        let mut engine = h.engine("m1");
        engine.tick().await;

        for _ in 0..10 {
            tokio::time::advance(INTERVAL).await;
            engine.tick().await;
            assert!(engine.is_leader());
        }
        let lease = h.registry.lease_manager().get(ENGINE_LEASE).await.unwrap().unwrap();
        assert_eq!(lease.holder, "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn failover_after_lease_expiry_keeps_bindings() {
        let h = Harness::new(&["m1", "m2", "m3"]).await;
        h.submit("sleep.service", JobState::Launched).await;

        let mut first = h.engine("m1");
        first.tick().await;
        let bound = h.target_of("sleep.service").await;
        assert!(!bound.is_empty());

        // The leader dies without releasing its lease.
        drop(first);
        let mut second = h.engine("m2");
        second.tick().await;
        assert!(!second.is_leader());

        tokio::time::advance(INTERVAL * LEASE_TTL_FACTOR + Duration::from_millis(1)).await;
        second.tick().await;
        assert!(second.is_leader());
        assert_eq!(h.target_of("sleep.service").await, bound);
    }

    #[tokio::test(start_paused = true)]
    async fn moved_lease_blocks_writes() {
        let h = Harness::new(&["m1"]).await;
        let mut engine = h.engine("m1");
        engine.tick().await;
        assert!(engine.is_leader());

        // Someone else takes over behind our back.
        let leases = h.registry.lease_manager();
        let held = leases.get(ENGINE_LEASE).await.unwrap().unwrap();
        leases.release(&held).await.unwrap();
        leases
            .acquire(ENGINE_LEASE, "intruder", "0", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        h.submit("sleep.service", JobState::Launched).await;
        let err = engine.reconcile().await.unwrap_err();
        assert!(matches!(err, EngineError::LeadershipLost(_)));
        assert_eq!(h.target_of("sleep.service").await, "");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_lease() {
        let h = Harness::new(&["m1"]).await;
        let mut engine = h.engine("m1");
        engine.tick().await;
        engine.stop().await;

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(h.registry.lease_manager().get(ENGINE_LEASE).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_machine_units_are_moved() {
        let h = Harness::new(&["m1", "m2"]).await;
        h.submit("sleep.service", JobState::Launched).await;
        let mut engine = h.engine("m1");
        engine.tick().await;
        let first = h.target_of("sleep.service").await;

        h.registry.remove_machine_state(&first).await.unwrap();
        engine.reconcile().await.unwrap();

        let second = h.target_of("sleep.service").await;
        assert!(!second.is_empty());
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn mirror_follows_decisions() {
        let h = Harness::new(&["m1"]).await;
        h.submit("sleep.service", JobState::Launched).await;
        let mirror = Arc::new(InMemoryRegistry::new());
        let mut engine = h.engine("m1").with_mirror(mirror.clone());
        engine.tick().await;

        let su = mirror.scheduled_unit("sleep.service").await.unwrap().unwrap();
        assert_eq!(su.target_machine_id, "m1");

        engine.stop().await;
        assert!(mirror.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown() {
        let h = Harness::new(&["m1"]).await;
        let engine = h.engine("m1");
        let leader = engine.leader();
        let (tx, rx) = watch::channel(false);
        let events = h.registry.job_event_stream().await.unwrap();

        let task = tokio::spawn(engine.run(Some(events), rx));
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(leader.borrow().as_deref(), Some("m1"));

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(h.registry.lease_manager().get(ENGINE_LEASE).await.unwrap().is_none());
    }
}
