//! Machine state and identity.
//!
//! Every machine advertises a [`MachineState`] under a TTL. The machine id
//! is read once at boot, normally from `/etc/machine-id`.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::requirements::parse_metadata_pair;

/// Number of leading id characters that identify a machine for humans.
pub const SHORT_ID_LEN: usize = 8;

/// Optional features a machine advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Serves and consumes the registry RPC fast path.
    Grpc,
    /// Never participates in engine leader election.
    DisableEngine,
}

/// Advertised state of one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub id: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl MachineState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    pub fn with_public_ip(mut self, ip: &str) -> Self {
        self.public_ip = ip.to_string();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    /// True when `id` is this machine's full id or its short form.
    pub fn match_id(&self, id: &str) -> bool {
        !id.is_empty() && (self.id == id || self.short_id() == id)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Overlay dynamic metadata. An empty value removes the key.
    pub fn merge_metadata(&mut self, dynamic: &BTreeMap<String, String>) {
        for (k, v) in dynamic {
            if v.is_empty() {
                self.metadata.remove(k);
            } else {
                self.metadata.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Parse `"k=v,k2=v2"` into a metadata map.
pub fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut metadata = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = parse_metadata_pair(pair).ok_or_else(|| format!("invalid metadata pair {pair:?}"))?;
        metadata.insert(k, v);
    }
    Ok(metadata)
}

/// Read a machine id file. Returns `None` when it is missing or blank.
pub fn read_machine_id(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let id = content.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read the machine id at `path`, or generate and persist one there.
pub fn load_or_generate_machine_id(path: &Path) -> io::Result<String> {
    if let Some(id) = read_machine_id(path)? {
        return Ok(id);
    }
    let id = generate_machine_id();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{id}\n"))?;
    Ok(id)
}

/// A random v4 UUID as 32 lowercase hex characters.
pub fn generate_machine_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_and_match_id() {
        let m = MachineState::new("0123456789abcdef");
        assert_eq!(m.short_id(), "01234567");
        assert!(m.match_id("0123456789abcdef"));
        assert!(m.match_id("01234567"));
        assert!(!m.match_id("0123"));
        assert!(!m.match_id(""));

        let tiny = MachineState::new("B");
        assert_eq!(tiny.short_id(), "B");
        assert!(tiny.match_id("B"));
    }

    #[test]
    fn capabilities_serialize_as_flags() {
        let m = MachineState::new("a")
            .with_capability(Capability::Grpc)
            .with_capability(Capability::DisableEngine);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"GRPC\""));
        assert!(json.contains("\"DISABLE_ENGINE\""));
        let back: MachineState = serde_json::from_str(&json).unwrap();
        assert!(back.has_capability(Capability::Grpc));
    }

    #[test]
    fn dynamic_metadata_overrides_and_deletes() {
        let mut m = MachineState::new("a")
            .with_metadata("region", "us-east")
            .with_metadata("disk", "ssd");
        let mut dynamic = BTreeMap::new();
        dynamic.insert("region".to_string(), "us-west".to_string());
        dynamic.insert("disk".to_string(), String::new());
        m.merge_metadata(&dynamic);
        assert_eq!(m.metadata.get("region").map(String::as_str), Some("us-west"));
        assert!(!m.metadata.contains_key("disk"));
    }

    #[test]
    fn parses_metadata_lists() {
        let md = parse_metadata("region=us-east, tier=1").unwrap();
        assert_eq!(md.len(), 2);
        assert!(parse_metadata("").unwrap().is_empty());
        assert!(parse_metadata("region").is_err());
    }

    #[test]
    fn machine_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/machine-id");
        assert_eq!(read_machine_id(&path).unwrap(), None);

        let first = load_or_generate_machine_id(&path).unwrap();
        assert_eq!(first.len(), 32);
        let second = load_or_generate_machine_id(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = generate_machine_id();
        let b = generate_machine_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }
}
