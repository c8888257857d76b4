//! Periodic unit-state polling.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use armada_core::UnitState;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error};

use crate::error::ExecutorResult;
use crate::executor::UnitExecutor;

pub const GENERATE_INTERVAL: Duration = Duration::from_secs(1);

/// Observed state of one unit; `None` means "no longer reported".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStateHeartbeat {
    pub name: String,
    pub state: Option<UnitState>,
}

#[derive(Default)]
struct Subscriptions {
    current: BTreeSet<String>,
    last: Option<BTreeSet<String>>,
}

pub struct UnitStateGenerator {
    executor: Arc<dyn UnitExecutor>,
    subs: Mutex<Subscriptions>,
}

impl UnitStateGenerator {
    pub fn new(executor: Arc<dyn UnitExecutor>) -> Self {
        Self {
            executor,
            subs: Mutex::new(Subscriptions::default()),
        }
    }

    pub async fn subscribe(&self, name: &str) {
        self.subs.lock().await.current.insert(name.to_string());
    }

    pub async fn unsubscribe(&self, name: &str) {
        self.subs.lock().await.current.remove(name);
    }

    /// States of subscribed units, followed by a `None` heartbeat for each
    /// unit unsubscribed since the previous call.
    pub async fn generate(&self) -> ExecutorResult<Vec<UnitStateHeartbeat>> {
        let subscribed = self.subs.lock().await.current.clone();
        let states = self.executor.unit_states(&subscribed).await?;

        let mut beats: Vec<UnitStateHeartbeat> = states
            .into_iter()
            .map(|(name, state)| UnitStateHeartbeat { name, state: Some(state) })
            .collect();

        let mut subs = self.subs.lock().await;
        if let Some(last) = &subs.last {
            beats.extend(
                last.difference(&subscribed)
                    .map(|name| UnitStateHeartbeat { name: name.clone(), state: None }),
            );
        }
        subs.last = Some(subscribed);
        Ok(beats)
    }

    /// Send heartbeats every [`GENERATE_INTERVAL`] until `stop` flips.
    pub async fn run(&self, tx: mpsc::Sender<UnitStateHeartbeat>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(GENERATE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let beats = match self.generate().await {
                        Ok(beats) => beats,
                        Err(e) => {
                            error!(error = %e, "failed fetching current unit states");
                            continue;
                        }
                    };
                    for beat in beats {
                        if tx.send(beat).await.is_err() {
                            debug!("unit state receiver gone, generator exiting");
                            return;
                        }
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use armada_core::UnitFile;

    use super::*;
    use crate::executor::FakeExecutor;

    #[tokio::test]
    async fn reports_subscribed_then_drops_unsubscribed() {
        let exec = Arc::new(FakeExecutor::new());
        let unit = UnitFile::parse("[Service]\nExecStart=/bin/true\n").unwrap();
        exec.load("a.service", &unit).await.unwrap();
        exec.load("b.service", &unit).await.unwrap();

        let generator = UnitStateGenerator::new(exec.clone());
        generator.subscribe("a.service").await;
        let beats = generator.generate().await.unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].name, "a.service");
        assert!(beats[0].state.is_some());

        generator.unsubscribe("a.service").await;
        let beats = generator.generate().await.unwrap();
        assert_eq!(
            beats,
            [UnitStateHeartbeat {
                name: "a.service".into(),
                state: None
            }]
        );

        // The removal is reported once.
        assert!(generator.generate().await.unwrap().is_empty());
    }
}
