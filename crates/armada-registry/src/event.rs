//! Cluster-significant change notifications.
//!
//! Events only say *what* changed. Reconcilers react by re-reading
//! authoritative snapshots, so a dropped or coalesced event costs at most
//! one tick of latency.

use std::sync::Arc;
use std::time::Duration;

use armada_store::{Store, StoreError, WatchEvent, WatchEventKind};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RegistryResult;
use crate::keys::{KeyRef, KeySpace};

/// Pause after a failed watch before trying again.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    UnitCreated(String),
    UnitDestroyed(String),
    TargetStateChanged(String),
    ScheduleChanged(String),
    MachineGained(String),
    MachineLost(String),
    MachineChanged(String),
    /// History was compacted past our position; re-read everything.
    Resync,
}

/// Ordered stream of [`RegistryEvent`]s from a store watch.
pub struct EventStream {
    store: Arc<dyn Store>,
    keys: KeySpace,
    prefix: String,
    revision: u64,
}

impl EventStream {
    /// Start watching `prefix` from the store's current revision.
    pub async fn new(store: Arc<dyn Store>, keys: KeySpace, prefix: String) -> RegistryResult<Self> {
        let revision = store.revision().await?;
        Ok(Self {
            store,
            keys,
            prefix,
            revision,
        })
    }

    /// Last store revision consumed.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wait for the next event. Returns `None` once `abort` flips to true
    /// or its sender goes away.
    pub async fn next(&mut self, abort: &mut watch::Receiver<bool>) -> Option<RegistryEvent> {
        loop {
            if *abort.borrow() {
                return None;
            }
            let result = tokio::select! {
                changed = abort.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
                result = self.store.watch(&self.prefix, self.revision) => result,
            };

            match result {
                Ok(event) => {
                    self.revision = event.revision;
                    if let Some(ev) = self.classify(&event) {
                        debug!(?ev, revision = event.revision, "registry event");
                        return Some(ev);
                    }
                }
                Err(StoreError::IndexCleared(at)) => {
                    warn!(revision = at, "watch position compacted, resyncing");
                    match self.store.revision().await {
                        Ok(current) => self.revision = current,
                        Err(e) => warn!(error = %e, "failed to read store revision"),
                    }
                    return Some(RegistryEvent::Resync);
                }
                Err(e) => {
                    warn!(error = %e, prefix = %self.prefix, "watch failed");
                    tokio::select! {
                        _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        changed = abort.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn classify(&self, event: &WatchEvent) -> Option<RegistryEvent> {
        let removed = matches!(event.kind, WatchEventKind::Delete | WatchEventKind::Expire);
        let unchanged = event.previous.is_some() && event.previous == event.value;

        match self.keys.parse(&event.key)? {
            KeyRef::JobObject(name) if removed => Some(RegistryEvent::UnitDestroyed(name.to_string())),
            KeyRef::JobObject(name) if event.previous.is_none() => {
                Some(RegistryEvent::UnitCreated(name.to_string()))
            }
            // The initial write accompanies UnitCreated.
            KeyRef::JobTargetState(name) if !removed && event.previous.is_some() && !unchanged => {
                Some(RegistryEvent::TargetStateChanged(name.to_string()))
            }
            KeyRef::JobTarget(name) | KeyRef::JobGlobalTarget { unit: name, .. } if !unchanged => {
                Some(RegistryEvent::ScheduleChanged(name.to_string()))
            }
            KeyRef::MachineObject(id) if removed => Some(RegistryEvent::MachineLost(id.to_string())),
            KeyRef::MachineObject(id) if event.previous.is_none() => {
                Some(RegistryEvent::MachineGained(id.to_string()))
            }
            KeyRef::MachineObject(id) if !unchanged => Some(RegistryEvent::MachineChanged(id.to_string())),
            KeyRef::MachineMetadata { machine, .. } if !unchanged => {
                Some(RegistryEvent::MachineChanged(machine.to_string()))
            }
            _ => None,
        }
    }
}
