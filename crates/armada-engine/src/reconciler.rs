//! Schedule reconciliation: snapshot in, decisions out.
//!
//! [`calculate_tasks`] never touches the registry. It decides every
//! unschedule first, then every placement, updating the snapshot as it
//! goes so that each decision sees the previous ones.

use std::fmt;

use armada_core::JobState;
use tracing::debug;

use crate::cluster::ClusterState;
use crate::placement::{able_to_run, choose_machine, global_targets, machine_satisfies};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Schedule,
    Unschedule,
}

/// One schedule decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTask {
    pub kind: TaskKind,
    pub unit: String,
    pub machine_id: String,
    pub reason: String,
}

impl EngineTask {
    fn schedule(unit: &str, machine_id: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Schedule,
            unit: unit.to_string(),
            machine_id: machine_id.to_string(),
            reason: reason.into(),
        }
    }

    fn unschedule(unit: &str, machine_id: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Unschedule,
            unit: unit.to_string(),
            machine_id: machine_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EngineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            TaskKind::Schedule => "schedule",
            TaskKind::Unschedule => "unschedule",
        };
        write!(f, "{verb} {} on {}: {}", self.unit, self.machine_id, self.reason)
    }
}

/// Compute the decisions that move `cluster` toward the desired schedule.
/// `cluster` is left reflecting them.
pub fn calculate_tasks(cluster: &mut ClusterState) -> Vec<EngineTask> {
    let mut tasks = Vec::new();

    // Removing one binding can invalidate another (a MachineOf peer
    // leaving), so repeat until stable.
    loop {
        let removed = unschedule_pass(cluster);
        if removed.is_empty() {
            break;
        }
        tasks.extend(removed);
    }

    loop {
        let placed = schedule_pass(cluster);
        if placed.is_empty() {
            break;
        }
        tasks.extend(placed);
    }

    tasks.extend(schedule_global(cluster));
    tasks
}

fn unschedule_reason(cluster: &ClusterState, name: &str, machine_id: &str) -> Option<String> {
    let Some(unit) = cluster.unit(name) else {
        return Some("unit no longer exists".into());
    };
    if unit.target_state == JobState::Inactive {
        return Some("target state inactive".into());
    }
    if !cluster.is_live(machine_id) {
        return Some("target machine went away".into());
    }

    let global = cluster.requirements(name).is_some_and(|r| r.global);
    let verdict = match (global, cluster.requirements(name), cluster.machine(machine_id)) {
        (true, Some(req), Some(machine)) => machine_satisfies(req, machine),
        _ => able_to_run(cluster, name, machine_id),
    };
    verdict.err().map(|why| format!("target machine no longer able to run unit: {why}"))
}

fn unschedule_pass(cluster: &mut ClusterState) -> Vec<EngineTask> {
    let mut tasks = Vec::new();
    for (name, machine_id) in cluster.bindings() {
        if let Some(reason) = unschedule_reason(cluster, &name, &machine_id) {
            cluster.unbind(&name, &machine_id);
            tasks.push(EngineTask::unschedule(&name, &machine_id, reason));
        }
    }
    tasks
}

fn schedule_pass(cluster: &mut ClusterState) -> Vec<EngineTask> {
    let pending: Vec<String> = cluster
        .units()
        .filter(|u| u.target_state != JobState::Inactive)
        .filter(|u| !cluster.requirements(&u.name).is_some_and(|r| r.global))
        .filter(|u| !cluster.is_scheduled(&u.name))
        .map(|u| u.name.clone())
        .collect();

    let mut tasks = Vec::new();
    for name in pending {
        match choose_machine(cluster, &name) {
            Some(machine_id) => {
                cluster.bind(&name, &machine_id);
                tasks.push(EngineTask::schedule(&name, &machine_id, "target state requires placement"));
            }
            None => debug!(unit = %name, "no eligible machine for unit"),
        }
    }
    tasks
}

fn schedule_global(cluster: &mut ClusterState) -> Vec<EngineTask> {
    let globals: Vec<String> = cluster
        .units()
        .filter(|u| u.target_state != JobState::Inactive)
        .filter(|u| cluster.requirements(&u.name).is_some_and(|r| r.global))
        .map(|u| u.name.clone())
        .collect();

    let mut tasks = Vec::new();
    for name in globals {
        for machine_id in global_targets(cluster, &name) {
            if !cluster.is_bound_to(&name, &machine_id) {
                cluster.bind(&name, &machine_id);
                tasks.push(EngineTask::schedule(&name, &machine_id, "global unit on eligible machine"));
            }
        }
    }
    tasks
}
