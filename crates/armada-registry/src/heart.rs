//! Machine presence.
//!
//! A [`Heart`] publishes this machine's state with a TTL; the [`Monitor`]
//! beats it every TTL/2 and gives up loudly when a beat cannot land within
//! TTL/3.

use std::sync::Arc;
use std::time::Duration;

use armada_core::MachineState;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::RegistryResult;
use crate::registry::Registry;

/// Beats attempted within one check window.
const ATTEMPTS_PER_CHECK: u32 = 4;

#[async_trait]
pub trait Heart: Send + Sync {
    /// Publish presence; returns the store revision of the write.
    async fn beat(&self, ttl: Duration) -> RegistryResult<u64>;

    /// Withdraw presence.
    async fn clear(&self) -> RegistryResult<()>;
}

/// Heart that writes the local [`MachineState`] through a registry.
pub struct MachineHeart {
    registry: Arc<dyn Registry>,
    state: Arc<RwLock<MachineState>>,
}

impl MachineHeart {
    pub fn new(registry: Arc<dyn Registry>, state: Arc<RwLock<MachineState>>) -> Self {
        Self { registry, state }
    }
}

#[async_trait]
impl Heart for MachineHeart {
    async fn beat(&self, ttl: Duration) -> RegistryResult<u64> {
        let state = self.state.read().await.clone();
        self.registry.set_machine_state(&state, ttl).await
    }

    async fn clear(&self) -> RegistryResult<()> {
        let id = self.state.read().await.id.clone();
        self.registry.remove_machine_state(&id).await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("no successful heartbeat within {window:?}: {last_error}")]
    TimedOut { window: Duration, last_error: String },
}

#[derive(Debug, Clone)]
pub struct Monitor {
    ttl: Duration,
    interval: Duration,
}

impl Monitor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            interval: ttl / 2,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Beat until `stop` flips. Returns an error as soon as one check fails.
    pub async fn run(&self, heart: &dyn Heart, mut stop: watch::Receiver<bool>) -> Result<(), MonitorError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(ttl = ?self.ttl, interval = ?self.interval, "machine heart monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let revision = self.check(heart).await?;
                    debug!(revision, "machine heartbeat");
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("monitor exiting on stop signal");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One beat, retried up to four times inside a TTL/3 window.
    pub async fn check(&self, heart: &dyn Heart) -> Result<u64, MonitorError> {
        let window = self.ttl / 3;
        let spacing = window / ATTEMPTS_PER_CHECK;
        let deadline = Instant::now() + window;
        let mut last_error = String::from("no attempt completed");

        loop {
            match tokio::time::timeout_at(deadline, heart.beat(self.ttl)).await {
                Ok(Ok(revision)) if revision > 0 => return Ok(revision),
                Ok(Ok(_)) => last_error = "store returned no revision".to_string(),
                Ok(Err(e)) => {
                    debug!(error = %e, retry_in = ?spacing, "heartbeat failed");
                    last_error = e.to_string();
                }
                Err(_) => break,
            }
            if Instant::now() + spacing >= deadline {
                break;
            }
            tokio::time::sleep(spacing).await;
        }
        Err(MonitorError::TimedOut { window, last_error })
    }
}
