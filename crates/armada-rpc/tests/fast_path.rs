//! End-to-end calls through a real tonic server on a loopback port.

use std::sync::Arc;
use std::time::Duration;

use armada_core::{Capability, JobState, MachineState, Unit, UnitFile, UnitState};
use armada_registry::{InMemoryRegistry, KeySpace, Registry, RegistryError, StoreRegistry};
use armada_rpc::{LeaderRegistry, RpcRegistry, RpcServer};
use armada_store::MemStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

const TTL: Duration = Duration::from_secs(30);

struct Harness {
    store: StoreRegistry,
    client: RpcRegistry,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<()>,
}

async fn start() -> Harness {
    let store = StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default());
    store
        .set_machine_state(&MachineState::new("m1").with_capability(Capability::Grpc), TTL)
        .await
        .unwrap();
    let leader = LeaderRegistry::new(store.clone(), Arc::new(InMemoryRegistry::new()));
    leader.load(TTL).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        RpcServer::new(Arc::new(leader))
            .serve_listener(listener, rx)
            .await
            .unwrap();
    });

    let client = RpcRegistry::connect_lazy(&addr.to_string()).unwrap();
    for _ in 0..50 {
        if client.probe().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(client.is_ready());

    Harness {
        store,
        client,
        shutdown,
        server,
    }
}

#[tokio::test]
async fn unit_lifecycle_over_rpc_reaches_store() {
    let h = start().await;
    let unit = Unit::new(
        "sleep.service",
        UnitFile::parse("[Service]\nExecStart=/bin/sleep 3000\n").unwrap(),
        JobState::Launched,
    );

    h.client.create_unit(&unit).await.unwrap();
    assert_eq!(h.client.unit("sleep.service").await.unwrap(), Some(unit.clone()));
    assert_eq!(h.store.unit("sleep.service").await.unwrap(), Some(unit));

    h.client.schedule_unit("sleep.service", "m1").await.unwrap();
    let su = h.client.scheduled_unit("sleep.service").await.unwrap().unwrap();
    assert_eq!(su.target_machine_id, "m1");

    let mut state = UnitState::new("sleep.service", "loaded", "active", "running");
    state.machine_id = "m1".into();
    h.client.unit_heartbeat("sleep.service", "m1", TTL).await.unwrap();
    h.client.save_unit_state("sleep.service", &state, TTL).await.unwrap();
    assert_eq!(h.client.unit_states().await.unwrap(), vec![state.clone()]);
    assert_eq!(h.store.unit_states().await.unwrap(), vec![state]);
    assert_eq!(
        h.client.schedule().await.unwrap()[0].state,
        JobState::Launched
    );

    h.client.destroy_unit("sleep.service").await.unwrap();
    assert!(h.store.units().await.unwrap().is_empty());

    h.shutdown.send(true).unwrap();
    h.server.await.unwrap();
}

#[tokio::test]
async fn registry_errors_cross_the_wire() {
    let h = start().await;
    let err = h.client.destroy_unit("ghost.service").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    h.client.unit_heartbeat("a.service", "m1", TTL).await.unwrap();
    let err = h.client.unit_heartbeat("a.service", "m2", TTL).await.unwrap_err();
    assert!(matches!(err, RegistryError::Conflict(_)));

    h.shutdown.send(true).unwrap();
    h.server.await.unwrap();
}

#[tokio::test]
async fn stopped_server_marks_client_not_ready() {
    let h = start().await;
    h.shutdown.send(true).unwrap();
    h.server.await.unwrap();

    let err = h.client.units().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!h.client.is_ready());
}
