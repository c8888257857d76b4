//! The local init-system seam.
//!
//! The agent never talks to a process supervisor directly; it goes through
//! a [`UnitExecutor`]. [`FakeExecutor`] keeps everything in memory and can
//! be told to fail, which is what the agent and cluster tests run against.

use std::collections::{BTreeMap, BTreeSet};

use armada_core::{UnitFile, UnitState};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{ExecutorError, ExecutorResult};

pub const LOAD_LOADED: &str = "loaded";
pub const ACTIVE_ACTIVE: &str = "active";
pub const ACTIVE_INACTIVE: &str = "inactive";
pub const ACTIVE_FAILED: &str = "failed";
pub const SUB_RUNNING: &str = "running";
pub const SUB_DEAD: &str = "dead";
pub const SUB_FAILED: &str = "failed";

#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Install a unit file. Loading an already loaded name replaces it.
    async fn load(&self, name: &str, unit: &UnitFile) -> ExecutorResult<()>;

    async fn unload(&self, name: &str) -> ExecutorResult<()>;

    async fn start(&self, name: &str) -> ExecutorResult<()>;

    async fn stop(&self, name: &str) -> ExecutorResult<()>;

    /// Names of every loaded unit.
    async fn units(&self) -> ExecutorResult<Vec<String>>;

    /// `None` when the unit is not loaded.
    async fn unit_state(&self, name: &str) -> ExecutorResult<Option<UnitState>>;

    /// States of the loaded units among `names`.
    async fn unit_states(&self, names: &BTreeSet<String>) -> ExecutorResult<BTreeMap<String, UnitState>> {
        let mut states = BTreeMap::new();
        for name in names {
            if let Some(state) = self.unit_state(name).await? {
                states.insert(name.clone(), state);
            }
        }
        Ok(states)
    }

    async fn reload_unit_files(&self) -> ExecutorResult<()>;
}

/// Executor operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeOp {
    Load,
    Unload,
    Start,
    Stop,
}

impl FakeOp {
    fn as_str(self) -> &'static str {
        match self {
            FakeOp::Load => "load",
            FakeOp::Unload => "unload",
            FakeOp::Start => "start",
            FakeOp::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
struct FakeUnit {
    hash: String,
    active: bool,
}

#[derive(Debug, Default)]
struct FakeInner {
    units: BTreeMap<String, FakeUnit>,
    failures: BTreeSet<(FakeOp, String)>,
    calls: Vec<String>,
    reloads: usize,
}

/// In-memory executor.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    inner: Mutex<FakeInner>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` on `name` fail.
    pub async fn fail_next(&self, op: FakeOp, name: &str) {
        self.inner.lock().await.failures.insert((op, name.to_string()));
    }

    /// Every successful operation so far, as `"<op> <name>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn reloads(&self) -> usize {
        self.inner.lock().await.reloads
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.inner.lock().await.units.get(name).is_some_and(|u| u.active)
    }

    async fn apply<F>(&self, op: FakeOp, name: &str, f: F) -> ExecutorResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, FakeUnit>) -> ExecutorResult<()> + Send,
    {
        let mut inner = self.inner.lock().await;
        if inner.failures.remove(&(op, name.to_string())) {
            return Err(ExecutorError::Failed {
                op: op.as_str(),
                unit: name.to_string(),
                reason: "injected failure".into(),
            });
        }
        f(&mut inner.units)?;
        inner.calls.push(format!("{} {name}", op.as_str()));
        Ok(())
    }
}

#[async_trait]
impl UnitExecutor for FakeExecutor {
    async fn load(&self, name: &str, unit: &UnitFile) -> ExecutorResult<()> {
        let hash = unit.hash();
        self.apply(FakeOp::Load, name, |units| {
            units.insert(name.to_string(), FakeUnit { hash, active: false });
            Ok(())
        })
        .await
    }

    async fn unload(&self, name: &str) -> ExecutorResult<()> {
        self.apply(FakeOp::Unload, name, |units| {
            units.remove(name);
            Ok(())
        })
        .await
    }

    async fn start(&self, name: &str) -> ExecutorResult<()> {
        self.apply(FakeOp::Start, name, |units| {
            let unit = units
                .get_mut(name)
                .ok_or_else(|| ExecutorError::NotLoaded(name.to_string()))?;
            unit.active = true;
            Ok(())
        })
        .await
    }

    async fn stop(&self, name: &str) -> ExecutorResult<()> {
        self.apply(FakeOp::Stop, name, |units| {
            if let Some(unit) = units.get_mut(name) {
                unit.active = false;
            }
            Ok(())
        })
        .await
    }

    async fn units(&self) -> ExecutorResult<Vec<String>> {
        Ok(self.inner.lock().await.units.keys().cloned().collect())
    }

    async fn unit_state(&self, name: &str) -> ExecutorResult<Option<UnitState>> {
        let inner = self.inner.lock().await;
        Ok(inner.units.get(name).map(|u| {
            let (active, sub) = if u.active {
                (ACTIVE_ACTIVE, SUB_RUNNING)
            } else {
                (ACTIVE_INACTIVE, SUB_DEAD)
            };
            let mut state = UnitState::new(name, LOAD_LOADED, active, sub);
            state.unit_hash = u.hash.clone();
            state
        }))
    }

    async fn reload_unit_files(&self) -> ExecutorResult<()> {
        self.inner.lock().await.reloads += 1;
        Ok(())
    }
}
