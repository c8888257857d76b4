//! The registry contract shared by the store-backed registry, the leader's
//! in-memory mirror, the RPC client, and the multiplexer.

use std::collections::HashMap;
use std::time::Duration;

use armada_core::{Job, JobState, MachineState, ScheduledUnit, Unit, UnitState};
use async_trait::async_trait;

use crate::error::RegistryResult;

#[async_trait]
pub trait Registry: Send + Sync {
    // ── Units ──────────────────────────────────────────────────────

    /// Store a new unit. Fails with `AlreadyExists` if the name is taken.
    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()>;

    /// Remove a unit and everything derived from it. The unit record goes
    /// last; dependent keys are removed best-effort.
    async fn destroy_unit(&self, name: &str) -> RegistryResult<()>;

    async fn set_unit_target_state(&self, name: &str, state: JobState) -> RegistryResult<()>;

    async fn units(&self) -> RegistryResult<Vec<Unit>>;

    async fn unit(&self, name: &str) -> RegistryResult<Option<Unit>>;

    // ── Schedule ───────────────────────────────────────────────────

    /// One entry per non-global unit (bound or not) and one per binding of
    /// a global unit.
    async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>>;

    /// Binding of a single unit. For global units, the first binding by
    /// machine id.
    async fn scheduled_unit(&self, name: &str) -> RegistryResult<Option<ScheduledUnit>>;

    /// Bind a unit to a machine. Only the engine leader may call this.
    async fn schedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()>;

    /// Remove the binding iff it points at `machine_id`. Missing bindings
    /// are not an error.
    async fn unschedule_unit(&self, name: &str, machine_id: &str) -> RegistryResult<()>;

    // ── Ownership ──────────────────────────────────────────────────

    /// Claim or refresh ownership of a unit. Fails with `Conflict` when
    /// another machine holds it.
    async fn unit_heartbeat(&self, name: &str, machine_id: &str, ttl: Duration) -> RegistryResult<()>;

    async fn clear_unit_heartbeat(&self, name: &str) -> RegistryResult<()>;

    // ── Observed state ─────────────────────────────────────────────

    async fn save_unit_state(&self, name: &str, state: &UnitState, ttl: Duration) -> RegistryResult<()>;

    async fn remove_unit_state(&self, name: &str) -> RegistryResult<()>;

    async fn unit_states(&self) -> RegistryResult<Vec<UnitState>>;

    // ── Machines ───────────────────────────────────────────────────

    async fn machines(&self) -> RegistryResult<Vec<MachineState>>;

    /// Publish machine presence; returns the store revision of the write.
    async fn set_machine_state(&self, state: &MachineState, ttl: Duration) -> RegistryResult<u64>;

    async fn remove_machine_state(&self, machine_id: &str) -> RegistryResult<()>;

    // ── Composite views ────────────────────────────────────────────

    async fn jobs(&self) -> RegistryResult<Vec<Job>> {
        let units = self.units().await?;
        let schedule = self.schedule().await?;
        let states = self.unit_states().await?;
        Ok(assemble_jobs(units, &schedule, &states))
    }

    async fn job(&self, name: &str) -> RegistryResult<Option<Job>> {
        let Some(unit) = self.unit(name).await? else {
            return Ok(None);
        };
        let schedule: Vec<ScheduledUnit> = self.scheduled_unit(name).await?.into_iter().collect();
        let states = self.unit_states().await?;
        Ok(assemble_jobs(vec![unit], &schedule, &states).into_iter().next())
    }
}

/// Join units with their bindings and observed states. Global units yield
/// one job per binding.
pub fn assemble_jobs(units: Vec<Unit>, schedule: &[ScheduledUnit], states: &[UnitState]) -> Vec<Job> {
    let mut bindings: HashMap<&str, Vec<&ScheduledUnit>> = HashMap::new();
    for su in schedule {
        bindings.entry(su.name.as_str()).or_default().push(su);
    }
    let state_of = |name: &str, machine: &str| {
        states
            .iter()
            .find(|s| s.unit_name == name && (machine.is_empty() || s.machine_id == machine))
            .cloned()
    };

    let mut jobs = Vec::new();
    for unit in units {
        let entries = bindings.remove(unit.name.as_str()).unwrap_or_default();
        if entries.is_empty() {
            jobs.push(Job {
                name: unit.name.clone(),
                unit: unit.unit.clone(),
                target_state: unit.target_state,
                state: JobState::Inactive,
                target_machine_id: String::new(),
                unit_state: None,
            });
            continue;
        }
        for su in entries {
            jobs.push(Job {
                name: unit.name.clone(),
                unit: unit.unit.clone(),
                target_state: unit.target_state,
                state: su.state,
                target_machine_id: su.target_machine_id.clone(),
                unit_state: if su.is_scheduled() {
                    state_of(&unit.name, &su.target_machine_id)
                } else {
                    None
                },
            });
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use armada_core::UnitFile;

    use super::*;

    fn unit(name: &str) -> Unit {
        Unit::new(name, UnitFile::default(), JobState::Launched)
    }

    #[test]
    fn assembles_unscheduled_and_scheduled_jobs() {
        let schedule = vec![ScheduledUnit {
            name: "b.service".into(),
            target_machine_id: "m1".into(),
            state: JobState::Launched,
        }];
        let mut us = UnitState::new("b.service", "loaded", "active", "running");
        us.machine_id = "m1".into();

        let jobs = assemble_jobs(vec![unit("a.service"), unit("b.service")], &schedule, &[us.clone()]);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Inactive);
        assert!(jobs[0].target_machine_id.is_empty());
        assert_eq!(jobs[1].target_machine_id, "m1");
        assert_eq!(jobs[1].unit_state, Some(us));
    }

    #[test]
    fn global_units_yield_one_job_per_binding() {
        let schedule: Vec<_> = ["m1", "m2"]
            .iter()
            .map(|m| ScheduledUnit {
                name: "g.service".into(),
                target_machine_id: m.to_string(),
                state: JobState::Loaded,
            })
            .collect();
        let jobs = assemble_jobs(vec![unit("g.service")], &schedule, &[]);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.unit_state.is_none()));
    }
}
