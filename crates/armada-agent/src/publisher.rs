//! Pushes observed unit states to the registry.
//!
//! Every heartbeat from the generator lands in a cache. Changed entries are
//! published immediately; the whole cache is republished every interval so
//! TTL-bound states stay alive. A `None` entry removes the state from the
//! registry and is then pruned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use armada_core::{MachineState, UnitState};
use armada_registry::Registry;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info};

use crate::generator::UnitStateHeartbeat;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Serialize)]
struct PublisherCache {
    states: BTreeMap<String, Option<UnitState>>,
}

pub struct UnitStatePublisher {
    registry: Arc<dyn Registry>,
    machine: Arc<RwLock<MachineState>>,
    ttl: Duration,
    interval: Duration,
    cache: RwLock<PublisherCache>,
}

impl UnitStatePublisher {
    pub fn new(registry: Arc<dyn Registry>, machine: Arc<RwLock<MachineState>>, ttl: Duration) -> Self {
        Self {
            registry,
            machine,
            ttl,
            interval: DEFAULT_PUBLISH_INTERVAL,
            cache: RwLock::new(PublisherCache::default()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Consume heartbeats until `stop` flips or the sender goes away.
    pub async fn run(&self, mut rx: mpsc::Receiver<UnitStateHeartbeat>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        info!(interval = ?self.interval, "unit state publisher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_all().await,
                beat = rx.recv() => {
                    let Some(beat) = beat else {
                        debug!("heartbeat sender gone, publisher exiting");
                        return;
                    };
                    self.handle(beat).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Stamp, cache and, if it changed, publish one heartbeat.
    pub async fn handle(&self, mut beat: UnitStateHeartbeat) {
        if let Some(state) = beat.state.as_mut() {
            state.machine_id = self.machine.read().await.id.clone();
            state.unit_name = beat.name.clone();
        }
        if self.update_cache(&beat).await {
            self.publish(&beat.name, beat.state.as_ref()).await;
        }
    }

    /// Returns true when the cached state for the unit changed.
    async fn update_cache(&self, beat: &UnitStateHeartbeat) -> bool {
        let mut cache = self.cache.write().await;
        let previous = cache.states.insert(beat.name.clone(), beat.state.clone());
        previous.as_ref() != Some(&beat.state)
    }

    /// Republish every cached entry, then prune removals.
    pub async fn publish_all(&self) {
        let snapshot: Vec<(String, Option<UnitState>)> = {
            let mut cache = self.cache.write().await;
            let snapshot = cache.states.clone().into_iter().collect();
            cache.states.retain(|_, state| state.is_some());
            snapshot
        };
        for (name, state) in snapshot {
            self.publish(&name, state.as_ref()).await;
        }
    }

    async fn publish(&self, name: &str, state: Option<&UnitState>) {
        match state {
            None => {
                debug!(unit = %name, "removing unit state");
                if let Err(e) = self.registry.remove_unit_state(name).await {
                    error!(unit = %name, error = %e, "failed to remove unit state");
                }
            }
            Some(state) if state.machine_id.is_empty() => {
                error!(unit = %name, "refusing to publish unit state without machine id");
            }
            Some(state) => {
                debug!(unit = %name, active = %state.active_state, "publishing unit state");
                if let Err(e) = self.registry.save_unit_state(name, state, self.ttl).await {
                    error!(unit = %name, error = %e, "failed to publish unit state");
                }
            }
        }
    }

    /// Remove every state this publisher has reported.
    pub async fn purge(&self) {
        let names: Vec<String> = {
            let mut cache = self.cache.write().await;
            let names = cache.states.keys().cloned().collect();
            cache.states.clear();
            names
        };
        for name in names {
            self.publish(&name, None).await;
        }
    }
}
