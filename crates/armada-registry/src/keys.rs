//! Key layout under the configurable prefix.

/// Builds and parses registry keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

/// A registry key split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef<'a> {
    JobObject(&'a str),
    JobTargetState(&'a str),
    JobTarget(&'a str),
    JobGlobalTarget { unit: &'a str, machine: &'a str },
    UnitState(&'a str),
    Heartbeat(&'a str),
    MachineObject(&'a str),
    MachineMetadata { machine: &'a str, key: &'a str },
    Lease(&'a str),
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("/fleet/")
    }
}

impl KeySpace {
    /// The prefix is normalised to start and end with `/`.
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // ── Units ──────────────────────────────────────────────────────

    pub fn jobs(&self) -> String {
        format!("{}job/", self.prefix)
    }

    pub fn job_dir(&self, name: &str) -> String {
        format!("{}job/{name}/", self.prefix)
    }

    pub fn job_object(&self, name: &str) -> String {
        format!("{}object", self.job_dir(name))
    }

    pub fn job_target_state(&self, name: &str) -> String {
        format!("{}target-state", self.job_dir(name))
    }

    pub fn job_target(&self, name: &str) -> String {
        format!("{}target", self.job_dir(name))
    }

    pub fn job_global_targets(&self, name: &str) -> String {
        format!("{}targets/", self.job_dir(name))
    }

    pub fn job_global_target(&self, name: &str, machine_id: &str) -> String {
        format!("{}{machine_id}", self.job_global_targets(name))
    }

    // ── Observed state ─────────────────────────────────────────────

    pub fn unit_states(&self) -> String {
        format!("{}state/", self.prefix)
    }

    pub fn unit_state(&self, name: &str) -> String {
        format!("{}{name}", self.unit_states())
    }

    pub fn heartbeats(&self) -> String {
        format!("{}heartbeat/", self.prefix)
    }

    pub fn heartbeat(&self, name: &str) -> String {
        format!("{}{name}", self.heartbeats())
    }

    // ── Machines ───────────────────────────────────────────────────

    pub fn machines(&self) -> String {
        format!("{}machines/", self.prefix)
    }

    pub fn machine_object(&self, machine_id: &str) -> String {
        format!("{}{machine_id}/object", self.machines())
    }

    pub fn machine_metadata_dir(&self, machine_id: &str) -> String {
        format!("{}{machine_id}/metadata/", self.machines())
    }

    pub fn machine_metadata(&self, machine_id: &str, key: &str) -> String {
        format!("{}{key}", self.machine_metadata_dir(machine_id))
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn lease(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Classify a full key. Returns `None` for keys outside the layout.
    pub fn parse<'a>(&self, key: &'a str) -> Option<KeyRef<'a>> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        let parts: Vec<&'a str> = rest.split('/').collect();
        match parts[..] {
            ["job", name, "object"] => Some(KeyRef::JobObject(name)),
            ["job", name, "target-state"] => Some(KeyRef::JobTargetState(name)),
            ["job", name, "target"] => Some(KeyRef::JobTarget(name)),
            ["job", unit, "targets", machine] => Some(KeyRef::JobGlobalTarget { unit, machine }),
            ["state", name] => Some(KeyRef::UnitState(name)),
            ["heartbeat", name] => Some(KeyRef::Heartbeat(name)),
            ["machines", id, "object"] => Some(KeyRef::MachineObject(id)),
            ["machines", machine, "metadata", key] => Some(KeyRef::MachineMetadata { machine, key }),
            [name] if !name.is_empty() => Some(KeyRef::Lease(name)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_normalised() {
        assert_eq!(KeySpace::new("fleet").prefix(), "/fleet/");
        assert_eq!(KeySpace::new("/a/b/").prefix(), "/a/b/");
        assert_eq!(KeySpace::new("").prefix(), "/");
    }

    #[test]
    fn builds_documented_layout() {
        let keys = KeySpace::default();
        assert_eq!(keys.job_object("a.service"), "/fleet/job/a.service/object");
        assert_eq!(keys.job_target_state("a.service"), "/fleet/job/a.service/target-state");
        assert_eq!(keys.job_target("a.service"), "/fleet/job/a.service/target");
        assert_eq!(keys.job_global_target("g.service", "m1"), "/fleet/job/g.service/targets/m1");
        assert_eq!(keys.unit_state("a.service"), "/fleet/state/a.service");
        assert_eq!(keys.heartbeat("a.service"), "/fleet/heartbeat/a.service");
        assert_eq!(keys.machine_object("m1"), "/fleet/machines/m1/object");
        assert_eq!(keys.machine_metadata("m1", "region"), "/fleet/machines/m1/metadata/region");
        assert_eq!(keys.lease("engine-leader"), "/fleet/engine-leader");
    }

    #[test]
    fn parses_every_key_it_builds() {
        let keys = KeySpace::default();
        assert_eq!(keys.parse(&keys.job_object("a")), Some(KeyRef::JobObject("a")));
        assert_eq!(keys.parse(&keys.job_target_state("a")), Some(KeyRef::JobTargetState("a")));
        assert_eq!(keys.parse(&keys.job_target("a")), Some(KeyRef::JobTarget("a")));
        assert_eq!(
            keys.parse(&keys.job_global_target("g", "m")),
            Some(KeyRef::JobGlobalTarget { unit: "g", machine: "m" })
        );
        assert_eq!(keys.parse(&keys.unit_state("a")), Some(KeyRef::UnitState("a")));
        assert_eq!(keys.parse(&keys.heartbeat("a")), Some(KeyRef::Heartbeat("a")));
        assert_eq!(keys.parse(&keys.machine_object("m")), Some(KeyRef::MachineObject("m")));
        assert_eq!(
            keys.parse(&keys.machine_metadata("m", "k")),
            Some(KeyRef::MachineMetadata { machine: "m", key: "k" })
        );
        assert_eq!(keys.parse(&keys.lease("engine-leader")), Some(KeyRef::Lease("engine-leader")));
        assert_eq!(keys.parse("/other/job/a/object"), None);
        assert_eq!(keys.parse("/fleet/job/a/unknown"), None);
    }
}
