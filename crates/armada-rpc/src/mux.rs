//! RegistryMux — picks the store or the leader's fast path per call.
//!
//! The mux tracks the current engine leader by polling the engine lease.
//! When both this machine and the leader speak GRPC and the connection is
//! ready, unit operations go over RPC; otherwise, and whenever a call hits
//! a transport failure, they go straight to the store. Machine presence
//! always uses the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use armada_core::{Capability, JobState, MachineState, ScheduledUnit, Unit, UnitState};
use armada_registry::{
    ENGINE_LEASE, ErrorKind, InMemoryRegistry, LeaseManager, Registry, RegistryResult, StoreRegistry,
};
use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::RpcRegistry;
use crate::server::{LeaderRegistry, RpcServer};

const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct LocalServer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LocalServer {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "rpc server task failed");
        }
    }
}

#[derive(Default)]
struct Route {
    leader: Option<String>,
    rpc: Option<RpcRegistry>,
    use_rpc: bool,
    server: Option<LocalServer>,
}

pub struct RegistryMux {
    store: StoreRegistry,
    local: Arc<RwLock<MachineState>>,
    mirror: Arc<InMemoryRegistry>,
    rpc_port: u16,
    mirror_ttl: Duration,
    route: RwLock<Route>,
}

impl RegistryMux {
    pub fn new(
        store: StoreRegistry,
        local: Arc<RwLock<MachineState>>,
        mirror: Arc<InMemoryRegistry>,
        rpc_port: u16,
        mirror_ttl: Duration,
    ) -> Self {
        Self {
            store,
            local,
            mirror,
            rpc_port,
            mirror_ttl,
            route: RwLock::new(Route::default()),
        }
    }

    pub fn store(&self) -> &StoreRegistry {
        &self.store
    }

    /// Whether unit calls currently go over RPC.
    pub async fn is_rpc_active(&self) -> bool {
        self.rpc_route().await.is_some()
    }

    pub async fn leader(&self) -> Option<String> {
        self.route.read().await.leader.clone()
    }

    fn rpc_addr(&self, leader: &MachineState) -> String {
        let host = if leader.public_ip.is_empty() {
            "127.0.0.1"
        } else {
            leader.public_ip.as_str()
        };
        format!("{host}:{}", self.rpc_port)
    }

    async fn rpc_route(&self) -> Option<RpcRegistry> {
        let route = self.route.read().await;
        match &route.rpc {
            Some(rpc) if route.use_rpc && rpc.is_ready() => Some(rpc.clone()),
            _ => None,
        }
    }

    /// React to a new engine leader, or to none.
    pub async fn engine_changed(&self, leader: Option<&MachineState>) {
        let local = self.local.read().await.clone();
        let mut route = self.route.write().await;
        route.leader = leader.map(|l| l.id.clone());
        info!(leader = ?route.leader, "engine changed");

        if !local.has_capability(Capability::Grpc) {
            route.use_rpc = false;
            info!("local machine lacks GRPC, using store registry");
            return;
        }

        let leading = leader.is_some_and(|l| l.id == local.id);
        if !leading {
            if let Some(server) = route.server.take() {
                info!("no longer engine leader, stopping rpc server");
                server.stop().await;
                self.mirror.clear().await;
            }
        } else if route.server.is_none() {
            route.server = self.start_server().await;
        }

        match leader {
            Some(l) if l.has_capability(Capability::Grpc) => {
                let addr = self.rpc_addr(l);
                let reusable = route
                    .rpc
                    .as_ref()
                    .is_some_and(|rpc| rpc.addr() == addr && rpc.is_ready());
                if reusable {
                    info!(%addr, "reusing ready rpc connection to engine");
                } else {
                    match RpcRegistry::connect_lazy(&addr) {
                        Ok(rpc) => {
                            info!(%addr, "engine supports GRPC, connecting");
                            rpc.probe().await;
                            route.rpc = Some(rpc);
                        }
                        Err(e) => {
                            warn!(%addr, error = %e, "cannot reach engine over rpc");
                            route.rpc = None;
                        }
                    }
                }
                route.use_rpc = route.rpc.is_some();
            }
            _ => {
                info!("falling back to store registry");
                route.use_rpc = false;
            }
        }
    }

    async fn start_server(&self) -> Option<LocalServer> {
        let leader = LeaderRegistry::new(self.store.clone(), Arc::clone(&self.mirror));
        if let Err(e) = leader.load(self.mirror_ttl).await {
            warn!(error = %e, "failed to load registry mirror, not serving rpc");
            return None;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.rpc_port));
        let (shutdown, rx) = watch::channel(false);
        let server = RpcServer::new(Arc::new(leader));
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(addr, rx).await {
                warn!(%addr, error = %e, "rpc server exited");
            }
        });
        info!(%addr, "rpc server starting");
        Some(LocalServer { shutdown, task })
    }

    /// One lease poll: follow leadership changes and re-probe a lost
    /// connection.
    pub async fn resolve(&self, leases: &LeaseManager) -> RegistryResult<()> {
        let holder = leases.get(ENGINE_LEASE).await?.map(|l| l.holder);
        let current = self.route.read().await.leader.clone();

        if holder != current {
            let leader = match &holder {
                Some(id) => self.store.machines().await?.into_iter().find(|m| &m.id == id),
                None => None,
            };
            self.engine_changed(leader.as_ref()).await;
            return Ok(());
        }

        let route = self.route.read().await;
        if let Some(rpc) = route.rpc.as_ref().filter(|rpc| route.use_rpc && !rpc.is_ready()) {
            if rpc.probe().await {
                info!(addr = %rpc.addr(), "rpc connection to engine is ready");
            }
        }
        Ok(())
    }

    /// Poll the engine lease every second until `shutdown` flips.
    pub async fn run(&self, leases: LeaseManager, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(LEASE_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resolve(&leases).await {
                        debug!(error = %e, "engine lease poll failed");
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
    }

    /// Stop the local server, if any, and fall back to the store.
    pub async fn stop(&self) {
        let mut route = self.route.write().await;
        route.use_rpc = false;
        route.leader = None;
        if let Some(server) = route.server.take() {
            server.stop().await;
            self.mirror.clear().await;
        }
    }
}

/// Call over RPC when the fast path is up; fall back to the store on a
/// transient failure or when it is down. Writes that are not idempotent
/// name their own fallback, since the leader may already have applied them.
macro_rules! route {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        route!($self, $method($($arg),*) else $self.store.$method($($arg),*))
    };
    ($self:ident, $method:ident ( $($arg:expr),* ) else $fallback:expr) => {{
        match $self.rpc_route().await {
            Some(rpc) => match rpc.$method($($arg),*).await {
                Err(e) if e.kind() == ErrorKind::Transient => {
                    warn!(op = stringify!($method), error = %e, "rpc call failed, using store");
                    $fallback.await
                }
                other => other,
            },
            None => $self.store.$method($($arg),*).await,
        }
    }};
}

/// Finish a create whose RPC outcome is unknown. An identical unit already
/// in the store means the leader applied it.
async fn settle_create(store: &StoreRegistry, unit: &Unit) -> RegistryResult<()> {
    match store.unit(&unit.name).await? {
        Some(existing) if existing.hash() == unit.hash() && existing.target_state == unit.target_state => {
            debug!(unit = %unit.name, "create already applied by leader");
            Ok(())
        }
        _ => store.create_unit(unit).await,
    }
}

/// Finish a destroy whose RPC outcome is unknown. A unit missing from the
/// store is treated as destroyed.
async fn settle_destroy(store: &StoreRegistry, name: &str) -> RegistryResult<()> {
    match store.unit(name).await? {
        None => {
            debug!(unit = %name, "destroy already applied by leader");
            Ok(())
        }
        Some(_) => store.destroy_unit(name).await,
    }
}

#[async_trait]
impl Registry for RegistryMux {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        route!(self, create_unit(unit) else settle_create(&self.store, unit))
    }

    async fn destroy_unit(&self, name: &str) -> RegistryResult<()> {
        route!(self, destroy_unit(name) else settle_destroy(&self.store, name))
    }

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()> {
        route!(self, set_unit_target_state(name, state))
    }

    async fn units(&self) -> RegistryResult<Vec<Unit>> {
        route!(self, units())
    }

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>> {
        route!(self, unit(name))
    }

    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        route!(self, schedule())
    }

    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>> {
        route!(self, scheduled_unit(name))
    }

    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        route!(self, schedule_unit(name, machine_id))
    }

    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        route!(self, unschedule_unit(name, machine_id))
    }

    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()> {
        route!(self, unit_heartbeat(name, machine_id, ttl))
    }

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()> {
        route!(self, clear_unit_heartbeat(name))
    }

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        route!(self, save_unit_state(name, state, ttl))
    }

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()> {
        route!(self, remove_unit_state(name))
    }

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        route!(self, unit_states())
    }

    async fn machines(&self) -> RegistryResult<Vec<MachineState>> {
        self.store.machines().await
    }

    async fn set_machine_state(&self, state: &MachineState, ttl: Duration) -> RegistryResult<u64> {
        self.store.set_machine_state(state, ttl).await
    }

    async fn remove_machine_state(&self, machine_id: &str) -> RegistryResult<()> {
        self.store.remove_machine_state(machine_id).await
    }
}
