//! Leader-side registry service.
//!
//! The engine leader serves [`LeaderRegistry`] over gRPC. Writes land in
//! the store first and then in the in-memory mirror. Reads come from the
//! mirror unless a machine without GRPC is present, in which case the
//! store is consulted as well since those agents never talk to us.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use armada_core::{Capability, JobState, MachineState, ScheduledUnit, Unit, UnitState};
use armada_registry::{InMemoryRegistry, Registry, RegistryResult, StoreRegistry};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tonic::transport::server::TcpIncoming;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult, to_status};
use crate::messages::*;
use crate::proto::registry_service_server::{RegistryService, RegistryServiceServer};

pub const DEFAULT_RPC_PORT: u16 = 50059;

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

// ── Leader registry ────────────────────────────────────────────────

/// Store-then-mirror registry served by the engine leader.
#[derive(Clone)]
pub struct LeaderRegistry {
    store: StoreRegistry,
    mirror: Arc<InMemoryRegistry>,
}

impl LeaderRegistry {
    pub fn new(store: StoreRegistry, mirror: Arc<InMemoryRegistry>) -> Self {
        Self { store, mirror }
    }

    /// Fill the mirror from the store before serving.
    pub async fn load(&self, ttl: Duration) -> RegistryResult<()> {
        self.mirror.load_from(&self.store, ttl).await
    }

    pub fn mirror(&self) -> &Arc<InMemoryRegistry> {
        &self.mirror
    }

    /// True when some live machine cannot use the fast path. Errs on the
    /// side of true.
    pub async fn has_non_grpc_agents(&self) -> bool {
        match self.store.machines().await {
            Ok(machines) => machines.iter().any(|m| !m.has_capability(Capability::Grpc)),
            Err(e) => {
                warn!(error = %e, "failed to list machines, assuming non-GRPC agents");
                true
            }
        }
    }
}

/// Overlay `authoritative` onto `cached`, keyed by `key`.
fn merge_by<T, F>(cached: Vec<T>, authoritative: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut merged: BTreeMap<String, T> = cached.into_iter().map(|t| (key(&t), t)).collect();
    merged.extend(authoritative.into_iter().map(|t| (key(&t), t)));
    merged.into_values().collect()
}

macro_rules! mirrored {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let out = $self.store.$method($($arg),*).await?;
        if let Err(e) = $self.mirror.$method($($arg),*).await {
            debug!(op = stringify!($method), error = %e, "mirror diverged from store");
        }
        Ok(out)
    }};
}

#[async_trait]
impl Registry for LeaderRegistry {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        mirrored!(self, create_unit(unit))
    }

    async fn destroy_unit(&self, name: &str) -> RegistryResult<()> {
        mirrored!(self, destroy_unit(name))
    }

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()> {
        mirrored!(self, set_unit_target_state(name, state))
    }

    async fn units(&self) -> RegistryResult<Vec<Unit>> {
        let cached = self.mirror.units().await?;
        if !self.has_non_grpc_agents().await {
            return Ok(cached);
        }
        let stored = self.store.units().await?;
        Ok(merge_by(cached, stored, |u| u.name.clone()))
    }

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>> {
        if self.has_non_grpc_agents().await {
            return self.store.unit(name).await;
        }
        match self.mirror.unit(name).await? {
            Some(unit) => Ok(Some(unit)),
            None => self.store.unit(name).await,
        }
    }

    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        if self.has_non_grpc_agents().await {
            self.store.schedule().await
        } else {
            self.mirror.schedule().await
        }
    }

    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>> {
        if self.has_non_grpc_agents().await {
            self.store.scheduled_unit(name).await
        } else {
            self.mirror.scheduled_unit(name).await
        }
    }

    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        mirrored!(self, schedule_unit(name, machine_id))
    }

    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        mirrored!(self, unschedule_unit(name, machine_id))
    }

    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()> {
        mirrored!(self, unit_heartbeat(name, machine_id, ttl))
    }

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()> {
        mirrored!(self, clear_unit_heartbeat(name))
    }

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        mirrored!(self, save_unit_state(name, state, ttl))
    }

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()> {
        mirrored!(self, remove_unit_state(name))
    }

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        let cached = self.mirror.unit_states().await?;
        if !self.has_non_grpc_agents().await {
            return Ok(cached);
        }
        let stored = self.store.unit_states().await?;
        Ok(merge_by(cached, stored, |s| s.unit_name.clone()))
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

// ── gRPC service ───────────────────────────────────────────────────

/// gRPC implementation of `armada.RegistryService`.
#[derive(Clone)]
pub struct RpcServer {
    registry: Arc<dyn Registry>,
    status: Arc<RwLock<ServingStatus>>,
}

impl RpcServer {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            status: Arc::new(RwLock::new(ServingStatus::NotServing)),
        }
    }

    pub async fn set_serving_status(&self, status: ServingStatus) {
        *self.status.write().await = status;
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> RegistryServiceServer<Self> {
        RegistryServiceServer::new(self)
    }

    /// Bind `addr`, retrying while the previous leader's socket lingers,
    /// then serve until `shutdown` flips.
    pub async fn serve(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> RpcResult<()> {
        let listener = bind_with_retry(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    pub async fn serve_listener(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> RpcResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| RpcError::Endpoint(e.to_string()))?;
        let incoming = TcpIncoming::from_listener(listener, true, None).map_err(|e| RpcError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        self.set_serving_status(ServingStatus::Serving).await;
        info!(%addr, "registry rpc server listening");

        let status = Arc::clone(&self.status);
        let result = tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(incoming, async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;

        *status.write().await = ServingStatus::NotServing;
        info!(%addr, "registry rpc server stopped");
        result.map_err(RpcError::from)
    }
}

async fn bind_with_retry(addr: SocketAddr) -> RpcResult<TcpListener> {
    let mut last = String::new();
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(%addr, attempt, error = %e, "rpc bind failed");
                last = e.to_string();
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
        }
    }
    Err(RpcError::Bind { addr, reason: last })
}

fn ttl_of(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[tonic::async_trait]
impl RegistryService for RpcServer {
    async fn status(&self, _request: Request<Empty>) -> Result<Response<HealthResponse>, Status> {
        let status = *self.status.read().await;
        Ok(Response::new(HealthResponse { status }))
    }

    async fn get_units(&self, _request: Request<Empty>) -> Result<Response<UnitsResponse>, Status> {
        let units = self.registry.units().await.map_err(to_status)?;
        Ok(Response::new(UnitsResponse { units }))
    }

    async fn get_unit(&self, request: Request<UnitName>) -> Result<Response<UnitResponse>, Status> {
        let req = request.into_inner();
        let unit = self.registry.unit(&req.name).await.map_err(to_status)?;
        Ok(Response::new(UnitResponse { unit }))
    }

    async fn get_scheduled_units(&self, _request: Request<Empty>) -> Result<Response<ScheduleResponse>, Status> {
        let units = self.registry.schedule().await.map_err(to_status)?;
        Ok(Response::new(ScheduleResponse { units }))
    }

    async fn get_scheduled_unit(
        &self,
        request: Request<UnitName>,
    ) -> Result<Response<ScheduledUnitResponse>, Status> {
        let req = request.into_inner();
        let unit = self.registry.scheduled_unit(&req.name).await.map_err(to_status)?;
        Ok(Response::new(ScheduledUnitResponse { unit }))
    }

    async fn get_unit_states(&self, _request: Request<Empty>) -> Result<Response<UnitStatesResponse>, Status> {
        let states = self.registry.unit_states().await.map_err(to_status)?;
        Ok(Response::new(UnitStatesResponse { states }))
    }

    async fn create_unit(&self, request: Request<CreateUnitRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry.create_unit(&req.unit).await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn destroy_unit(&self, request: Request<UnitName>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry.destroy_unit(&req.name).await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn set_unit_target_state(&self, request: Request<TargetStateRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .set_unit_target_state(&req.name, req.state)
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn schedule_unit(&self, request: Request<ScheduleRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .schedule_unit(&req.name, &req.machine_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn unschedule_unit(&self, request: Request<ScheduleRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .unschedule_unit(&req.name, &req.machine_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn unit_heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .unit_heartbeat(&req.name, &req.machine_id, ttl_of(req.ttl_ms))
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn clear_unit_heartbeat(&self, request: Request<UnitName>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry.clear_unit_heartbeat(&req.name).await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn save_unit_state(&self, request: Request<SaveStateRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .save_unit_state(&req.name, &req.state, ttl_of(req.ttl_ms))
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn remove_unit_state(&self, request: Request<UnitName>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.registry.remove_unit_state(&req.name).await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }
}
