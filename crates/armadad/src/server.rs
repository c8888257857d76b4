//! Component supervisor.
//!
//! ```text
//! register (heart beat, backoff) ──► start components ──► monitor
//!        ▲                                                  │
//!        │        monitor failed: stop, purge, delay        │
//!        └──────────────────────────────────────────────────┤
//!                                                           │ shutdown
//!                                                           ▼
//!                                                   stop, purge, exit
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use armada_agent::{
    Agent, AgentReconciler, ProcessExecutor, UnitExecutor, UnitSpool, UnitStateGenerator, UnitStatePublisher,
};
use armada_core::machine::{load_or_generate_machine_id, read_machine_id};
use armada_core::{Capability, DaemonConfig, MachineState, StoreBackend};
use armada_engine::Engine;
use armada_registry::{Heart, InMemoryRegistry, KeySpace, MachineHeart, Monitor, Registry, StoreRegistry};
use armada_rpc::RegistryMux;
use armada_store::{EtcdConfig, EtcdStore, MemStore, RetryPolicy, Store};
use serde_json::json;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Pause between a monitor failure and the restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Components get this long to exit before they are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_REGISTER_BACKOFF: Duration = Duration::from_secs(60);

const HEARTBEAT_CHANNEL_SIZE: usize = 64;

pub struct Server {
    config: DaemonConfig,
    store: Arc<dyn Store>,
    executor: Arc<dyn UnitExecutor>,
    machine: Arc<RwLock<MachineState>>,
}

/// Everything one run of the components shares.
struct Running {
    stop: watch::Sender<bool>,
    tasks: JoinSet<()>,
    mirror: Arc<InMemoryRegistry>,
    generator: Arc<UnitStateGenerator>,
    agent: Arc<Agent>,
    reconciler: Arc<AgentReconciler>,
    publisher: Arc<UnitStatePublisher>,
    heart: Arc<MachineHeart>,
}

impl Server {
    /// Build the store, machine identity and process executor from `config`.
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = match config.store {
            StoreBackend::Etcd => {
                let etcd = EtcdStore::new(EtcdConfig {
                    endpoints: config.etcd_servers.clone(),
                    request_timeout: config.etcd_request_timeout(),
                    retry: RetryPolicy::default(),
                })
                .context("configuring etcd store")?;
                Arc::new(etcd)
            }
            StoreBackend::Memory => Arc::new(MemStore::new()),
        };
        let id = resolve_machine_id(&config).context("determining machine id")?;
        let machine = machine_from_config(&config, &id)?;
        Ok(Self::with_parts(config, store, Arc::new(ProcessExecutor::new()), machine))
    }

    pub fn with_parts(
        config: DaemonConfig,
        store: Arc<dyn Store>,
        executor: Arc<dyn UnitExecutor>,
        machine: MachineState,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            machine: Arc::new(RwLock::new(machine)),
        }
    }

    pub fn machine(&self) -> Arc<RwLock<MachineState>> {
        Arc::clone(&self.machine)
    }

    pub fn store_registry(&self) -> StoreRegistry {
        StoreRegistry::new(Arc::clone(&self.store), KeySpace::new(&self.config.etcd_key_prefix))
    }

    /// Run until `shutdown` flips, restarting the components whenever the
    /// machine heart fails.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let monitor = Monitor::new(self.config.agent_ttl());
        loop {
            let mut running = self.start().await?;
            if !register(running.heart.as_ref(), &monitor, &mut shutdown).await {
                running.halt().await;
                return Ok(());
            }
            running.spawn_components(self).await?;

            let stop_rx = running.stop.subscribe();
            let failure = tokio::select! {
                result = monitor.run(running.heart.as_ref(), stop_rx) => result.err(),
                _ = shutdown_requested(&mut shutdown) => None,
            };

            running.halt().await;
            running.purge().await;
            match failure {
                None => {
                    info!("server stopped");
                    return Ok(());
                }
                Some(e) => {
                    error!(error = %e, "server monitor triggered, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                        _ = shutdown_requested(&mut shutdown) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Build the registry chain and agent for one run. Nothing is spawned.
    async fn start(&self) -> anyhow::Result<Running> {
        let ttl = self.config.agent_ttl();
        let (stop, _) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let store_registry = self.store_registry();
        let mirror = Arc::new(InMemoryRegistry::new());
        let registry: Arc<dyn Registry> = if self.config.enable_grpc {
            let mux = Arc::new(RegistryMux::new(
                store_registry.clone(),
                self.machine(),
                Arc::clone(&mirror),
                self.config.rpc_port,
                ttl,
            ));
            let leases = store_registry.lease_manager();
            let rx = stop.subscribe();
            let runner = Arc::clone(&mux);
            tasks.spawn(async move { runner.run(leases, rx).await });
            mux
        } else {
            Arc::new(store_registry)
        };

        let generator = Arc::new(UnitStateGenerator::new(Arc::clone(&self.executor)));
        let mut agent = Agent::new(
            Arc::clone(&registry),
            Arc::clone(&self.executor),
            Arc::clone(&generator),
            self.machine(),
            ttl,
        );
        let spool_dir = &self.config.unit_spool_dir;
        let spool = UnitSpool::open(spool_dir)
            .await
            .with_context(|| format!("opening unit spool {}", spool_dir.display()))?;
        agent = agent.with_spool(spool);

        let publisher = UnitStatePublisher::new(Arc::clone(&registry), self.machine(), ttl)
            .with_interval(self.config.unit_state_publish_interval());

        Ok(Running {
            stop,
            tasks,
            mirror,
            generator,
            agent: Arc::new(agent),
            reconciler: Arc::new(AgentReconciler::new()),
            publisher: Arc::new(publisher),
            heart: Arc::new(MachineHeart::new(registry, self.machine())),
        })
    }

    /// State summary as JSON.
    pub async fn dump_state(&self) -> serde_json::Value {
        let machine = self.machine.read().await.clone();
        let units = match self.executor.units().await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "cannot list executor units");
                Vec::new()
            }
        };
        json!({
            "machine": machine,
            "engine_enabled": self.engine_enabled(&machine),
            "units": units,
        })
    }

    fn engine_enabled(&self, machine: &MachineState) -> bool {
        !self.config.disable_engine && !machine.has_capability(Capability::DisableEngine)
    }
}

impl Running {
    async fn spawn_components(&mut self, server: &Server) -> anyhow::Result<()> {
        let store_registry = server.store_registry();
        let machine = server.machine.read().await.clone();

        if server.engine_enabled(&machine) {
            let mut engine = Engine::new(
                Arc::new(store_registry.clone()),
                store_registry.lease_manager(),
                server.machine(),
                server.config.engine_reconcile_interval(),
            );
            if server.config.enable_grpc {
                engine = engine.with_mirror(Arc::clone(&self.mirror));
            }
            let events = match store_registry.job_event_stream().await {
                Ok(events) => Some(events),
                Err(e) => {
                    warn!(error = %e, "engine starting without registry events");
                    None
                }
            };
            self.tasks.spawn(engine.run(events, self.stop.subscribe()));
        } else {
            info!("not starting engine; disable_engine is set");
        }

        self.agent.initialize().await.context("re-acquiring spooled units")?;

        let agent = Arc::clone(&self.agent);
        let rx = self.stop.subscribe();
        self.tasks.spawn(async move { agent.run_heartbeats(rx).await });

        let events = store_registry.job_event_stream().await.ok();
        let reconciler = Arc::clone(&self.reconciler);
        let agent = Arc::clone(&self.agent);
        let rx = self.stop.subscribe();
        self.tasks.spawn(async move { reconciler.run(agent, events, rx).await });

        let (beat_tx, beat_rx) = mpsc::channel(HEARTBEAT_CHANNEL_SIZE);
        let generator = Arc::clone(&self.generator);
        let rx = self.stop.subscribe();
        self.tasks.spawn(async move { generator.run(beat_tx, rx).await });

        let publisher = Arc::clone(&self.publisher);
        let rx = self.stop.subscribe();
        self.tasks.spawn(async move { publisher.run(beat_rx, rx).await });

        info!(machine_id = %machine.id, components = self.tasks.len(), "server components started");
        Ok(())
    }

    /// Signal every component and wait for it to exit.
    async fn halt(&mut self) {
        self.stop.send_replace(true);
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "server component failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            error!(timeout = ?SHUTDOWN_TIMEOUT, "components did not stop in time, aborting them");
            self.tasks.abort_all();
        }
    }

    /// Unload every unit and withdraw this machine from the registry.
    async fn purge(&self) {
        info!("purging local state");
        self.reconciler.purge(&self.agent).await;
        self.publisher.purge().await;
        if let Err(e) = self.heart.clear().await {
            warn!(error = %e, "failed to clear machine state");
        }
    }
}

/// Beat until one lands, backing off exponentially. Returns false when
/// shutdown arrived first.
async fn register(heart: &dyn Heart, monitor: &Monitor, shutdown: &mut watch::Receiver<bool>) -> bool {
    info!("establishing store connectivity");
    let mut backoff = Duration::from_secs(1);
    loop {
        match heart.beat(monitor.ttl()).await {
            Ok(revision) => {
                info!(revision, "machine registered");
                return true;
            }
            Err(e) => error!(error = %e, retry_in = ?backoff, "machine registration failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_requested(shutdown) => return false,
        }
        backoff = (backoff * 2).min(MAX_REGISTER_BACKOFF);
    }
}

/// Resolves once `rx` reads true or its sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Explicit id, then the machine-id file, then a generated id persisted
/// next to the unit spool.
pub fn resolve_machine_id(config: &DaemonConfig) -> anyhow::Result<String> {
    if let Some(id) = config.machine_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if let Some(id) = read_machine_id(&config.machine_id_file)? {
        return Ok(id);
    }
    let path = generated_id_path(&config.unit_spool_dir);
    let id = load_or_generate_machine_id(&path)
        .with_context(|| format!("persisting machine id to {}", path.display()))?;
    info!(path = %path.display(), "using generated machine id");
    Ok(id)
}

fn generated_id_path(spool_dir: &Path) -> PathBuf {
    spool_dir.with_file_name("machine-id")
}

pub fn machine_from_config(config: &DaemonConfig, id: &str) -> anyhow::Result<MachineState> {
    let mut machine = MachineState::new(id).with_public_ip(&config.public_ip);
    for (key, value) in config.metadata_map()? {
        machine = machine.with_metadata(&key, &value);
    }
    if config.enable_grpc {
        machine = machine.with_capability(Capability::Grpc);
    }
    if config.disable_engine {
        machine = machine.with_capability(Capability::DisableEngine);
    }
    Ok(machine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_advertises_config() {
        let config = DaemonConfig {
            metadata: "region=us-east,disk=ssd".into(),
            public_ip: "10.0.0.1".into(),
            enable_grpc: true,
            disable_engine: true,
            ..DaemonConfig::default()
        };
        let machine = machine_from_config(&config, "m1").unwrap();
        assert_eq!(machine.public_ip, "10.0.0.1");
        assert_eq!(machine.metadata["disk"], "ssd");
        assert!(machine.has_capability(Capability::Grpc));
        assert!(machine.has_capability(Capability::DisableEngine));
    }

    #[test]
    fn machine_id_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join("etc-machine-id");
        let mut config = DaemonConfig {
            machine_id_file: id_file.clone(),
            unit_spool_dir: dir.path().join("units"),
            ..DaemonConfig::default()
        };

        // Nothing configured: generated and persisted beside the spool.
        let generated = resolve_machine_id(&config).unwrap();
        assert_eq!(generated.len(), 32);
        assert_eq!(resolve_machine_id(&config).unwrap(), generated);
        assert!(dir.path().join("machine-id").exists());

        std::fs::write(&id_file, "from-file\n").unwrap();
        assert_eq!(resolve_machine_id(&config).unwrap(), "from-file");

        config.machine_id = Some("explicit".into());
        assert_eq!(resolve_machine_id(&config).unwrap(), "explicit");
    }

    #[tokio::test]
    async fn shutdown_requested_sees_earlier_flip() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        shutdown_requested(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
