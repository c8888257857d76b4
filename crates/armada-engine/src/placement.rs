//! Placement constraints and machine selection.
//!
//! A machine can run a unit when every `[X-Armada]` directive holds:
//!
//! ```text
//! MachineID        machine id (full or short) matches
//! MachineMetadata  every declared key present with an accepted value
//! MachineOf        every peer already bound to the machine
//! Conflicts        no unit on the machine matches our globs, and we match none of theirs
//! ```
//!
//! Among eligible machines the least loaded wins; ties go to the
//! lexicographically smallest id.

use std::collections::BTreeSet;
use std::fmt;

use armada_core::{MachineState, Requirements, glob_match};

use crate::cluster::ClusterState;

/// Why a unit cannot be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownUnit,
    UnknownMachine,
    MachineId(String),
    Metadata,
    MissingPeer(String),
    Conflict(String),
    /// `MachineOf` chain leads back to the unit itself.
    PeerCycle,
    /// A peer is also named by the unit's own `Conflicts`.
    PeerConflict(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownUnit => f.write_str("unit does not exist"),
            Rejection::UnknownMachine => f.write_str("machine is not live"),
            Rejection::MachineId(id) => write!(f, "unit requires machine {id}"),
            Rejection::Metadata => f.write_str("machine metadata does not match"),
            Rejection::MissingPeer(peer) => write!(f, "peer {peer} is not on the machine"),
            Rejection::Conflict(other) => write!(f, "conflicts with {other}"),
            Rejection::PeerCycle => f.write_str("MachineOf peers form a cycle"),
            Rejection::PeerConflict(peer) => write!(f, "peer {peer} is also a conflict"),
        }
    }
}

fn matches_any(globs: &[String], name: &str) -> bool {
    // Invalid globs match nothing.
    globs.iter().any(|g| glob_match(g, name).unwrap_or(false))
}

/// Machine-local directives only: `MachineID` and `MachineMetadata`.
pub fn machine_satisfies(req: &Requirements, machine: &MachineState) -> Result<(), Rejection> {
    if let Some(id) = &req.machine_id {
        if !machine.match_id(id) {
            return Err(Rejection::MachineId(id.clone()));
        }
    }
    if !req.metadata_satisfied_by(&machine.metadata) {
        return Err(Rejection::Metadata);
    }
    Ok(())
}

/// Checks that do not depend on any machine.
pub fn check_schedulable(cluster: &ClusterState, name: &str) -> Result<(), Rejection> {
    let req = cluster.requirements(name).ok_or(Rejection::UnknownUnit)?;

    if let Some(peer) = req.peers.iter().find(|p| matches_any(&req.conflicts, p)) {
        return Err(Rejection::PeerConflict(peer.clone()));
    }

    // Walk MachineOf edges looking for a path back to `name`.
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = req.peers.iter().map(String::as_str).collect();
    while let Some(peer) = stack.pop() {
        if peer == name {
            return Err(Rejection::PeerCycle);
        }
        if !seen.insert(peer) {
            continue;
        }
        if let Some(peer_req) = cluster.requirements(peer) {
            stack.extend(peer_req.peers.iter().map(String::as_str));
        }
    }
    Ok(())
}

/// Whether `name` may be bound to `machine_id` given everything else
/// currently bound. The unit's own binding is ignored.
pub fn able_to_run(cluster: &ClusterState, name: &str, machine_id: &str) -> Result<(), Rejection> {
    let req = cluster.requirements(name).ok_or(Rejection::UnknownUnit)?;
    let machine = cluster.machine(machine_id).ok_or(Rejection::UnknownMachine)?;

    check_schedulable(cluster, name)?;
    machine_satisfies(req, machine)?;

    if let Some(peer) = req.peers.iter().find(|p| !cluster.is_bound_to(p, machine_id)) {
        return Err(Rejection::MissingPeer(peer.clone()));
    }

    for other in cluster.hosted_on(machine_id).filter(|o| *o != name) {
        if matches_any(&req.conflicts, other) {
            return Err(Rejection::Conflict(other.to_string()));
        }
        if cluster
            .requirements(other)
            .is_some_and(|r| matches_any(&r.conflicts, name))
        {
            return Err(Rejection::Conflict(other.to_string()));
        }
    }
    Ok(())
}

/// Pick a machine for a non-global unit: eligible, least loaded, then by id.
pub fn choose_machine(cluster: &ClusterState, name: &str) -> Option<String> {
    cluster
        .machines()
        .filter(|m| able_to_run(cluster, name, &m.id).is_ok())
        .min_by(|a, b| {
            cluster
                .load(&a.id)
                .cmp(&cluster.load(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|m| m.id.clone())
}

/// Machines a global unit should be bound to.
pub fn global_targets(cluster: &ClusterState, name: &str) -> Vec<String> {
    let Some(req) = cluster.requirements(name) else {
        return Vec::new();
    };
    cluster
        .machines()
        .filter(|m| machine_satisfies(req, m).is_ok())
        .map(|m| m.id.clone())
        .collect()
}
