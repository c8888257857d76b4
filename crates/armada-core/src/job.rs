//! Desired units, schedule bindings, and observed unit state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnitError;
use crate::requirements::Requirements;
use crate::unit::UnitFile;

/// Lifecycle state of a unit, both as a target and as observed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Inactive,
    Loaded,
    Launched,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Loaded => "loaded",
            JobState::Launched => "launched",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "loaded" => Ok(JobState::Loaded),
            "launched" => Ok(JobState::Launched),
            other => Err(UnitError::InvalidState(other.to_string())),
        }
    }
}

/// A unit as submitted by a client: name, file, and target state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub unit: UnitFile,
    pub target_state: JobState,
}

impl Unit {
    pub fn new(name: &str, unit: UnitFile, target_state: JobState) -> Self {
        Self {
            name: name.to_string(),
            unit,
            target_state,
        }
    }

    pub fn hash(&self) -> String {
        self.unit.hash()
    }

    /// Placement directives declared in the unit's `[X-Armada]` section.
    pub fn requirements(&self) -> Requirements {
        Requirements::from_unit(&self.name, &self.unit)
    }

    pub fn is_global(&self) -> bool {
        self.requirements().global
    }
}

/// Engine decision binding a unit to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledUnit {
    pub name: String,
    /// Empty when the unit is not bound anywhere.
    #[serde(default)]
    pub target_machine_id: String,
    /// Last observed state on the target machine.
    #[serde(default)]
    pub state: JobState,
}

impl ScheduledUnit {
    pub fn is_scheduled(&self) -> bool {
        !self.target_machine_id.is_empty()
    }
}

/// Observed runtime state of one unit on one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub unit_name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub unit_hash: String,
}

impl UnitState {
    pub fn new(unit_name: &str, load: &str, active: &str, sub: &str) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            load_state: load.to_string(),
            active_state: active.to_string(),
            sub_state: sub.to_string(),
            machine_id: String::new(),
            unit_hash: String::new(),
        }
    }
}

/// Composite view of a unit, assembled from the registry's separate records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub unit: UnitFile,
    pub target_state: JobState,
    pub state: JobState,
    pub target_machine_id: String,
    pub unit_state: Option<UnitState>,
}

/// Observed job state given the unit heartbeat holder, the target machine,
/// and whether a unit state has been reported.
pub fn determine_job_state(heartbeat: Option<&str>, target: &str, unit_state: Option<&UnitState>) -> JobState {
    if target.is_empty() || unit_state.is_none() {
        return JobState::Inactive;
    }
    match heartbeat {
        Some(holder) if holder == target => JobState::Launched,
        _ => JobState::Loaded,
    }
}
