//! Multi-machine scenarios over one in-process store.
//!
//! Every machine gets its own engine, agent, generator and publisher, all
//! talking to a shared `MemStore`. `Cluster::converge` steps them in
//! lockstep so the outcome does not depend on task scheduling.

use std::sync::Arc;
use std::time::Duration;

use armada_agent::{Agent, AgentReconciler, FakeExecutor, UnitExecutor, UnitStateGenerator, UnitStatePublisher};
use armada_core::{DaemonConfig, JobState, MachineState, StoreBackend, Unit, UnitFile};
use armada_engine::Engine;
use armada_registry::{KeySpace, Registry, StoreRegistry};
use armada_store::MemStore;
use armadad::Server;
use tokio::sync::{RwLock, watch};

const INTERVAL: Duration = Duration::from_secs(1);
const MACHINE_TTL: Duration = Duration::from_secs(10);
const AGENT_TTL: Duration = Duration::from_secs(30);

struct Node {
    machine: Arc<RwLock<MachineState>>,
    exec: Arc<FakeExecutor>,
    generator: Arc<UnitStateGenerator>,
    agent: Arc<Agent>,
    reconciler: AgentReconciler,
    publisher: UnitStatePublisher,
    engine: Option<Engine>,
    alive: bool,
}

impl Node {
    async fn id(&self) -> String {
        self.machine.read().await.id.clone()
    }
}

struct Cluster {
    registry: Arc<StoreRegistry>,
    nodes: Vec<Node>,
}

impl Cluster {
    fn new() -> Self {
        let registry = Arc::new(StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default()));
        Self {
            registry,
            nodes: Vec::new(),
        }
    }

    async fn add(&mut self, machine: MachineState) {
        let machine = Arc::new(RwLock::new(machine));
        let registry: Arc<dyn Registry> = self.registry.clone();
        let exec = Arc::new(FakeExecutor::new());
        let generator = Arc::new(UnitStateGenerator::new(exec.clone()));
        let agent = Arc::new(Agent::new(
            registry.clone(),
            exec.clone(),
            generator.clone(),
            machine.clone(),
            AGENT_TTL,
        ));
        let engine = Engine::new(registry.clone(), self.registry.lease_manager(), machine.clone(), INTERVAL);
        let node = Node {
            publisher: UnitStatePublisher::new(registry, machine.clone(), AGENT_TTL),
            machine,
            exec,
            generator,
            agent,
            reconciler: AgentReconciler::new(),
            engine: Some(engine),
            alive: true,
        };
        self.beat(&node).await;
        self.nodes.push(node);
    }

    async fn beat(&self, node: &Node) {
        let state = node.machine.read().await.clone();
        self.registry.set_machine_state(&state, MACHINE_TTL).await.unwrap();
    }

    fn node(&self, id: &str) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.machine.try_read().is_ok_and(|m| m.id == id))
            .unwrap()
    }

    /// Stop a machine's processes and withdraw it from the registry.
    async fn kill(&mut self, id: &str) {
        for node in &mut self.nodes {
            if node.id().await == id {
                node.alive = false;
                node.engine = None;
            }
        }
        self.registry.remove_machine_state(id).await.unwrap();
    }

    /// Drop a machine's engine without releasing its lease.
    fn kill_engine(&mut self, id: &str) {
        for node in &mut self.nodes {
            if node.machine.try_read().is_ok_and(|m| m.id == id) {
                node.engine = None;
            }
        }
    }

    async fn converge(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.nodes.iter().filter(|n| n.alive) {
                self.beat(node).await;
            }
            for node in self.nodes.iter_mut().filter(|n| n.alive) {
                if let Some(engine) = node.engine.as_mut() {
                    engine.tick().await;
                }
            }
            for node in self.nodes.iter().filter(|n| n.alive) {
                node.reconciler.reconcile_and_wait(&node.agent).await.unwrap();
                for beat in node.generator.generate().await.unwrap() {
                    node.publisher.handle(beat).await;
                }
            }
        }
    }

    async fn submit(&self, name: &str, placement: &str) {
        let raw = format!("[Service]\nExecStart=/bin/sleep 3000\n\n[X-Armada]\n{placement}\n");
        let unit = Unit::new(name, UnitFile::parse(&raw).unwrap(), JobState::Launched);
        self.registry.create_unit(&unit).await.unwrap();
    }

    async fn target_of(&self, name: &str) -> Option<String> {
        self.registry
            .scheduled_unit(name)
            .await
            .unwrap()
            .filter(|su| su.is_scheduled())
            .map(|su| su.target_machine_id)
    }

    async fn leader(&self) -> Option<String> {
        for node in &self.nodes {
            if node.engine.as_ref().is_some_and(|e| e.is_leader()) {
                return Some(node.id().await);
            }
        }
        None
    }
}

fn machine(id: &str) -> MachineState {
    MachineState::new(id)
}

#[tokio::test(start_paused = true)]
async fn simple_service_is_launched() {
    let mut cluster = Cluster::new();
    cluster.add(machine("a")).await;
    cluster.add(machine("b")).await;
    cluster.submit("sleep.service", "").await;
    cluster.converge(3).await;

    let target = cluster.target_of("sleep.service").await.unwrap();
    let node = cluster.node(&target);
    assert_eq!(node.exec.calls().await, ["load sleep.service", "start sleep.service"]);

    let states = cluster.registry.unit_states().await.unwrap();
    let state = states.iter().find(|s| s.unit_name == "sleep.service").unwrap();
    assert_eq!(state.active_state, "active");
    assert_eq!(state.machine_id, target);

    let job = cluster.registry.job("sleep.service").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Launched);

    // The other machine never touched it.
    let other = if target == "a" { "b" } else { "a" };
    assert!(cluster.node(other).exec.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pinned_unit_follows_its_machine() {
    let mut cluster = Cluster::new();
    cluster.add(machine("a")).await;
    cluster.add(machine("b")).await;
    cluster.submit("pinned.service", "MachineID=b").await;
    cluster.converge(3).await;
    assert_eq!(cluster.target_of("pinned.service").await.as_deref(), Some("b"));

    cluster.kill("b").await;
    cluster.converge(2).await;
    assert_eq!(cluster.target_of("pinned.service").await, None);
    let job = cluster.registry.job("pinned.service").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Inactive);
    assert!(cluster.node("a").exec.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn metadata_accepts_any_listed_value() {
    let mut cluster = Cluster::new();
    cluster.add(machine("a").with_metadata("region", "us-east")).await;
    cluster.add(machine("b").with_metadata("region", "eu-west")).await;
    cluster
        .submit(
            "edge.service",
            "MachineMetadata=region=us-east\nMachineMetadata=region=us-west",
        )
        .await;
    cluster.converge(3).await;

    assert_eq!(cluster.target_of("edge.service").await.as_deref(), Some("a"));
    assert!(cluster.node("a").exec.is_active("edge.service").await);
}

#[tokio::test(start_paused = true)]
async fn peers_are_colocated_and_move_together() {
    let mut cluster = Cluster::new();
    for id in ["a", "b", "c"] {
        cluster.add(machine(id)).await;
    }
    cluster.submit("db.service", "").await;
    cluster.submit("app.service", "MachineOf=db.service").await;
    cluster.converge(3).await;

    let db = cluster.target_of("db.service").await.unwrap();
    assert_eq!(cluster.target_of("app.service").await.as_deref(), Some(db.as_str()));

    // The dead machine's unit heartbeats and, possibly, the engine lease
    // have to expire before anyone else may take over.
    cluster.kill(&db).await;
    tokio::time::advance(AGENT_TTL + INTERVAL).await;
    cluster.converge(4).await;

    let moved = cluster.target_of("db.service").await.unwrap();
    assert_ne!(moved, db);
    assert_eq!(cluster.target_of("app.service").await.as_deref(), Some(moved.as_str()));
    let node = cluster.node(&moved);
    assert!(node.exec.is_active("db.service").await);
    assert!(node.exec.is_active("app.service").await);
}

#[tokio::test(start_paused = true)]
async fn conflicting_units_never_share_a_machine() {
    let mut cluster = Cluster::new();
    cluster.add(machine("a")).await;
    cluster.add(machine("b")).await;
    cluster.submit("worker.1.service", "Conflicts=worker.*.service").await;
    cluster.submit("worker.2.service", "Conflicts=worker.*.service").await;
    cluster.converge(3).await;

    let one = cluster.target_of("worker.1.service").await.unwrap();
    let two = cluster.target_of("worker.2.service").await.unwrap();
    assert_ne!(one, two);
}

#[tokio::test(start_paused = true)]
async fn conflicting_unit_waits_for_a_second_machine() {
    let mut cluster = Cluster::new();
    cluster.add(machine("a")).await;
    cluster.submit("worker.1.service", "Conflicts=worker.*.service").await;
    cluster.submit("worker.2.service", "Conflicts=worker.*.service").await;
    cluster.converge(3).await;

    let placed: Vec<_> = [
        cluster.target_of("worker.1.service").await,
        cluster.target_of("worker.2.service").await,
    ]
    .into_iter()
    .flatten()
    .collect();
    assert_eq!(placed, ["a"]);

    cluster.add(machine("b")).await;
    cluster.converge(2).await;
    assert!(cluster.target_of("worker.1.service").await.is_some());
    assert!(cluster.target_of("worker.2.service").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn engine_failover_keeps_bindings() {
    let mut cluster = Cluster::new();
    for id in ["a", "b", "c"] {
        cluster.add(machine(id)).await;
    }
    cluster.submit("sleep.service", "").await;
    cluster.converge(2).await;

    let leader = cluster.leader().await.unwrap();
    let bound = cluster.target_of("sleep.service").await.unwrap();

    cluster.kill_engine(&leader);
    cluster.converge(1).await;
    assert_eq!(cluster.leader().await, None);

    tokio::time::advance(INTERVAL * 5 + Duration::from_millis(1)).await;
    cluster.converge(1).await;

    let successor = cluster.leader().await.unwrap();
    assert_ne!(successor, leader);
    assert_eq!(cluster.target_of("sleep.service").await, Some(bound));
}

#[tokio::test(start_paused = true)]
async fn server_runs_units_and_purges_on_shutdown() {
    let spool = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        store: StoreBackend::Memory,
        engine_reconcile_interval_secs: 1,
        unit_state_publish_interval_secs: 1,
        unit_spool_dir: spool.path().join("units"),
        ..DaemonConfig::default()
    };
    let exec = Arc::new(FakeExecutor::new());
    let server = Arc::new(Server::with_parts(
        config,
        Arc::new(MemStore::new()),
        exec.clone(),
        MachineState::new("m1"),
    ));
    let registry = server.store_registry();
    let raw = "[Service]\nExecStart=/bin/sleep 3000\n";
    let unit = Unit::new("sleep.service", UnitFile::parse(raw).unwrap(), JobState::Launched);
    registry.create_unit(&unit).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let runner = server.clone();
    let task = tokio::spawn(async move { runner.run(rx).await });

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(exec.is_active("sleep.service").await);
    let states = registry.unit_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].machine_id, "m1");
    assert!(spool.path().join("units").join("sleep.service").exists());

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert!(exec.units().await.unwrap().is_empty());
    assert!(registry.unit_states().await.unwrap().is_empty());
    assert!(registry.machines().await.unwrap().is_empty());
    assert!(!spool.path().join("units").join("sleep.service").exists());
}
