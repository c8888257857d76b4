//! Placement directives from a unit's `[X-Armada]` section.
//!
//! Keys may be written as `MachineOf`, `ConditionMachineOf` or
//! `X-ConditionMachineOf`; a leading `X-` and then a leading `Condition`
//! are stripped before matching. Values may hold several space-separated
//! (optionally quoted) entries and may use `%n`, `%N`, `%p`, `%i`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::{UnitError, UnitResult};
use crate::unit::{UnitFile, UnitNameInfo};

/// Section that carries placement directives.
pub const PLACEMENT_SECTION: &str = "X-Armada";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    MachineId,
    MachineBootId,
    MachineMetadata,
    MachineOf,
    Conflicts,
    Global,
}

impl Directive {
    fn from_key(key: &str) -> Option<Self> {
        let key = key.strip_prefix("X-").unwrap_or(key);
        let key = key.strip_prefix("Condition").unwrap_or(key);
        match key {
            "MachineID" => Some(Directive::MachineId),
            "MachineBootID" => Some(Directive::MachineBootId),
            "MachineMetadata" => Some(Directive::MachineMetadata),
            "MachineOf" => Some(Directive::MachineOf),
            "Conflicts" => Some(Directive::Conflicts),
            "Global" => Some(Directive::Global),
            _ => None,
        }
    }
}

/// Normalised placement constraints of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    /// Full or short id of the only machine the unit may run on.
    pub machine_id: Option<String>,
    /// Key → accepted values. Every key must be present on the machine
    /// with one of its values.
    pub metadata: BTreeMap<String, BTreeSet<String>>,
    /// Units that must already be scheduled on the same machine.
    pub peers: Vec<String>,
    /// Globs naming units that must not share the machine.
    pub conflicts: Vec<String>,
    pub global: bool,
}

impl Requirements {
    pub fn from_unit(name: &str, file: &UnitFile) -> Self {
        let info = UnitNameInfo::parse(name);
        let expand = |v: &str| match &info {
            Some(info) => info.expand_specifiers(v),
            None => v.to_string(),
        };

        let mut req = Requirements::default();
        let mut machine_ids = Vec::new();
        let mut boot_ids = Vec::new();

        for opt in file.options().iter().filter(|o| o.section == PLACEMENT_SECTION) {
            let Some(directive) = Directive::from_key(&opt.name) else {
                continue;
            };
            if directive == Directive::Global {
                req.global = opt.value.trim().eq_ignore_ascii_case("true");
                continue;
            }
            for value in split_values(&opt.value) {
                let value = expand(&value);
                match directive {
                    Directive::MachineId => machine_ids.push(value),
                    Directive::MachineBootId => boot_ids.push(value),
                    Directive::MachineMetadata => match parse_metadata_pair(&value) {
                        Some((k, v)) => {
                            req.metadata.entry(k).or_default().insert(v);
                        }
                        None => warn!(unit = %name, value = %value, "ignoring malformed metadata requirement"),
                    },
                    Directive::MachineOf => req.peers.push(value),
                    Directive::Conflicts => req.conflicts.push(value),
                    Directive::Global => {}
                }
            }
        }

        req.machine_id = machine_ids.into_iter().next().or_else(|| boot_ids.into_iter().next());
        req
    }

    pub fn is_empty(&self) -> bool {
        *self == Requirements::default()
    }

    /// True when `metadata` carries every required key with an accepted value.
    pub fn metadata_satisfied_by(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.metadata.iter().all(|(key, accepted)| {
            metadata.get(key).is_some_and(|have| accepted.contains(have))
        })
    }
}

/// Reject units whose placement section holds keys this scheduler does not
/// understand.
pub fn validate_requirements(file: &UnitFile) -> UnitResult<()> {
    for opt in file.options().iter().filter(|o| o.section == PLACEMENT_SECTION) {
        if Directive::from_key(&opt.name).is_none() {
            return Err(UnitError::UnknownDirective(opt.name.clone()));
        }
    }
    Ok(())
}

/// `k=v` with both sides non-empty.
pub fn parse_metadata_pair(pair: &str) -> Option<(String, String)> {
    let (k, v) = pair.split_once('=')?;
    let (k, v) = (k.trim(), v.trim());
    if k.is_empty() || v.is_empty() || v.contains('=') {
        return None;
    }
    Some((k.to_string(), v.to_string()))
}

/// Split on whitespace outside double quotes, dropping the quotes.
fn split_values(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in raw.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    values.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    values
}
