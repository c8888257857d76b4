//! Serialised execution of per-unit task chains.
//!
//! At most one chain per unit name is in flight. Chains for different
//! units run concurrently, each on its own tokio task, and report every
//! step on a channel sized to the chain.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use armada_core::Unit;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::error::{AgentError, AgentResult, TaskError, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Load,
    Unload,
    Start,
    Stop,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Load => "load",
            TaskKind::Unload => "unload",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub reason: &'static str,
}

impl Task {
    pub fn new(kind: TaskKind, reason: &'static str) -> Self {
        Self { kind, reason }
    }
}

/// Ordered tasks for one unit. `unit` carries the file for `Load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChain {
    pub name: String,
    pub unit: Option<Unit>,
    pub tasks: Vec<Task>,
}

impl TaskChain {
    pub fn new(name: &str, unit: Option<Unit>) -> Self {
        Self {
            name: name.to_string(),
            unit,
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: TaskKind, reason: &'static str) {
        self.tasks.push(Task::new(kind, reason));
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.tasks.iter().map(|t| t.kind).collect()
    }
}

impl fmt::Display for TaskChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.name)?;
        for (i, task) in self.tasks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", task.kind)?;
        }
        f.write_str("]")
    }
}

/// Result of one task.
#[derive(Debug)]
pub struct TaskOutcome {
    pub unit: String,
    pub task: Task,
    pub result: AgentResult<()>,
}

/// Receiving end of a running chain.
pub struct TaskHandle {
    pub unit: String,
    results: mpsc::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the chain to finish. A failed task is the last outcome.
    pub async fn wait(mut self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.results.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Wait and log each outcome.
    pub async fn log(self) {
        for outcome in self.wait().await {
            match &outcome.result {
                Ok(()) => info!(
                    unit = %outcome.unit,
                    task = %outcome.task.kind,
                    reason = outcome.task.reason,
                    "agent task completed"
                ),
                Err(e) => warn!(
                    unit = %outcome.unit,
                    task = %outcome.task.kind,
                    reason = outcome.task.reason,
                    error = %e,
                    "agent task failed"
                ),
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct TaskManager {
    processing: Arc<Mutex<BTreeSet<String>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_processing(&self, name: &str) -> bool {
        self.processing.lock().await.contains(name)
    }

    /// Start `chain` against `agent`. Rejected with `Busy` while another
    /// chain for the same unit runs.
    pub async fn submit(&self, chain: TaskChain, agent: Arc<Agent>) -> TaskResult<TaskHandle> {
        if chain.tasks.is_empty() {
            return Err(TaskError::EmptyChain(chain.name));
        }
        if !self.processing.lock().await.insert(chain.name.clone()) {
            return Err(TaskError::Busy(chain.name));
        }

        let (tx, rx) = mpsc::channel(chain.tasks.len());
        let processing = self.processing.clone();
        let name = chain.name.clone();
        tokio::spawn(async move {
            for task in &chain.tasks {
                let result = run_task(&agent, &chain, task.kind).await;
                let failed = result.is_err();
                let outcome = TaskOutcome {
                    unit: chain.name.clone(),
                    task: task.clone(),
                    result,
                };
                // Capacity equals the chain length; this never waits.
                let _ = tx.send(outcome).await;
                if failed {
                    break;
                }
            }
            processing.lock().await.remove(&chain.name);
            drop(tx);
        });

        Ok(TaskHandle { unit: name, results: rx })
    }
}

async fn run_task(agent: &Agent, chain: &TaskChain, kind: TaskKind) -> AgentResult<()> {
    match kind {
        TaskKind::Load => {
            let unit = chain
                .unit
                .as_ref()
                .ok_or_else(|| AgentError::MissingUnitFile(chain.name.clone()))?;
            agent.load_unit(unit).await
        }
        TaskKind::Unload => agent.unload_unit(&chain.name).await,
        TaskKind::Start => agent.start_unit(&chain.name).await,
        TaskKind::Stop => agent.stop_unit(&chain.name).await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use armada_core::{JobState, MachineState, UnitFile};
    use armada_registry::{KeySpace, StoreRegistry};
    use armada_store::MemStore;
    use tokio::sync::RwLock;

    use super::*;
    use crate::executor::{FakeExecutor, FakeOp};
    use crate::generator::UnitStateGenerator;

    fn setup() -> (Arc<FakeExecutor>, Arc<Agent>) {
        let registry = Arc::new(StoreRegistry::new(Arc::new(MemStore::new()), KeySpace::default()));
        let exec = Arc::new(FakeExecutor::new());
        let generator = Arc::new(UnitStateGenerator::new(exec.clone()));
        let machine = Arc::new(RwLock::new(MachineState::new("m1")));
        let agent = Agent::new(registry, exec.clone(), generator, machine, Duration::from_secs(30));
        (exec, Arc::new(agent))
    }

    fn chain(name: &str, kinds: &[TaskKind]) -> TaskChain {
        let file = UnitFile::parse("[Service]\nExecStart=/bin/sleep 3000\n").unwrap();
        let mut chain = TaskChain::new(name, Some(Unit::new(name, file, JobState::Launched)));
        for kind in kinds {
            chain.push(*kind, "test");
        }
        chain
    }

    #[tokio::test]
    async fn runs_chain_in_order() {
        let (exec, agent) = setup();
        let tm = TaskManager::new();
        let handle = tm
            .submit(chain("a.service", &[TaskKind::Load, TaskKind::Start]), agent)
            .await
            .unwrap();

        let outcomes = handle.wait().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(exec.calls().await, ["load a.service", "start a.service"]);
        assert!(!tm.is_processing("a.service").await);
    }

    #[tokio::test]
    async fn failure_aborts_rest_of_chain() {
        let (exec, agent) = setup();
        exec.fail_next(FakeOp::Load, "a.service").await;
        let tm = TaskManager::new();
        let outcomes = tm
            .submit(chain("a.service", &[TaskKind::Load, TaskKind::Start]), agent)
            .await
            .unwrap()
            .wait()
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
        assert!(exec.calls().await.is_empty());
    }

    #[tokio::test]
    async fn second_chain_for_same_unit_is_busy() {
        let (_exec, agent) = setup();
        let tm = TaskManager::new();
        let first = tm
            .submit(chain("a.service", &[TaskKind::Load]), agent.clone())
            .await
            .unwrap();
        let second = tm.submit(chain("a.service", &[TaskKind::Load]), agent.clone()).await;
        assert_eq!(second.err(), Some(TaskError::Busy("a.service".into())));

        // Other units are not blocked.
        let other = tm.submit(chain("b.service", &[TaskKind::Load]), agent.clone()).await;
        assert!(other.is_ok());

        first.wait().await;
        assert!(tm.submit(chain("a.service", &[TaskKind::Unload]), agent).await.is_ok());
    }

    #[tokio::test]
    async fn empty_chain_is_rejected() {
        let (_exec, agent) = setup();
        let tm = TaskManager::new();
        let res = tm.submit(TaskChain::new("a.service", None), agent).await;
        assert_eq!(res.err(), Some(TaskError::EmptyChain("a.service".into())));
    }

    #[test]
    fn chain_display() {
        assert_eq!(
            chain("a.service", &[TaskKind::Unload, TaskKind::Load]).to_string(),
            "a.service [unload, load]"
        );
    }
}
