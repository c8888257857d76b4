//! Registry client that talks to the engine leader over gRPC.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use armada_core::{JobState, MachineState, ScheduledUnit, Unit, UnitState};
use armada_registry::{Registry, RegistryError, RegistryResult};
use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult, from_status, is_transport_failure};
use crate::messages::*;
use crate::proto::registry_service_client::RegistryServiceClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// [`Registry`] forwarding to a remote `armada.RegistryService`.
///
/// The channel connects lazily. Readiness is learned from health probes
/// and cleared by the first call that fails at the transport level.
#[derive(Clone)]
pub struct RpcRegistry {
    addr: String,
    client: RegistryServiceClient<Channel>,
    ready: Arc<AtomicBool>,
}

impl RpcRegistry {
    /// `addr` is `host:port`.
    pub fn connect_lazy(addr: &str) -> RpcResult<Self> {
        let uri = format!("http://{addr}");
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| RpcError::Endpoint(format!("{uri}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        Ok(Self {
            addr: addr.to_string(),
            client: RegistryServiceClient::new(endpoint.connect_lazy()),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Ask the server for its health and record the answer.
    pub async fn probe(&self) -> bool {
        let serving = match self.client.clone().status(Empty {}).await {
            Ok(resp) => resp.into_inner().status == ServingStatus::Serving,
            Err(status) => {
                debug!(addr = %self.addr, error = %status, "rpc health probe failed");
                false
            }
        };
        self.ready.store(serving, Ordering::SeqCst);
        serving
    }

    fn finish<T>(&self, result: Result<Response<T>, Status>) -> RegistryResult<T> {
        match result {
            Ok(resp) => Ok(resp.into_inner()),
            Err(status) => {
                if is_transport_failure(&status) && self.ready.swap(false, Ordering::SeqCst) {
                    warn!(addr = %self.addr, error = %status, "rpc registry connection lost");
                }
                Err(from_status(status))
            }
        }
    }

    fn client(&self) -> RegistryServiceClient<Channel> {
        self.client.clone()
    }
}

fn unit_name(name: &str) -> UnitName {
    UnitName { name: name.to_string() }
}

#[async_trait]
impl Registry for RpcRegistry {
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        let req = CreateUnitRequest { unit: unit.clone() };
        self.finish(self.client().create_unit(req).await).map(drop)
    }

    async fn destroy_unit(&self, name: &str) -> RegistryResult<()> {
        self.finish(self.client().destroy_unit(unit_name(name)).await).map(drop)
    }

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()> {
        let req = TargetStateRequest {
            name: name.to_string(),
            state,
        };
        self.finish(self.client().set_unit_target_state(req).await).map(drop)
    }

    async fn units(&self) -> RegistryResult<Vec<Unit>> {
        self.finish(self.client().get_units(Empty {}).await).map(|r| r.units)
    }

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>> {
        self.finish(self.client().get_unit(unit_name(name)).await).map(|r| r.unit)
    }

    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        self.finish(self.client().get_scheduled_units(Empty {}).await)
            .map(|r| r.units)
    }

    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>> {
        self.finish(self.client().get_scheduled_unit(unit_name(name)).await)
            .map(|r| r.unit)
    }

    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let req = ScheduleRequest {
            name: name.to_string(),
            machine_id: machine_id.to_string(),
        };
        self.finish(self.client().schedule_unit(req).await).map(drop)
    }

    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()> {
        let req = ScheduleRequest {
            name: name.to_string(),
            machine_id: machine_id.to_string(),
        };
        self.finish(self.client().unschedule_unit(req).await).map(drop)
    }

    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()> {
        let req = HeartbeatRequest {
            name: name.to_string(),
            machine_id: machine_id.to_string(),
            ttl_ms: millis(ttl),
        };
        self.finish(self.client().unit_heartbeat(req).await).map(drop)
    }

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()> {
        self.finish(self.client().clear_unit_heartbeat(unit_name(name)).await)
            .map(drop)
    }

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        let req = SaveStateRequest {
            name: name.to_string(),
            state: state.clone(),
            ttl_ms: millis(ttl),
        };
        self.finish(self.client().save_unit_state(req).await).map(drop)
    }

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()> {
        self.finish(self.client().remove_unit_state(unit_name(name)).await)
            .map(drop)
    }

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        self.finish(self.client().get_unit_states(Empty {}).await)
            .map(|r| r.states)
    }

    // Machine presence is always written to the store directly.

    async fn machines(&self) -> RegistryResult<Vec<MachineState>> {
        Err(RegistryError::Invalid("machines are not served over rpc".into()))
    }

    async fn set_machine_state(&self, _state: &MachineState, _ttl: Duration) -> RegistryResult<u64> {
        Err(RegistryError::Invalid("machine state is not served over rpc".into()))
    }

    async fn remove_machine_state(&self, _machine_id: &str) -> RegistryResult<()> {
        Err(RegistryError::Invalid("machine state is not served over rpc".into()))
    }
}
