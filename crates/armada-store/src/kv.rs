//! The store contract shared by every backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// One key with its revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: u64,
    /// Revision of the last write; the token for revision-guarded CAS.
    pub mod_revision: u64,
    /// Remaining time to live, if the key is ephemeral.
    pub ttl: Option<Duration>,
}

/// Guard evaluated atomically with a write or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Condition {
    #[default]
    None,
    /// Key must not exist (create).
    Absent,
    /// Key must exist (update).
    Present,
    /// Key must exist with exactly this value.
    Value(String),
    /// Key must exist with exactly this modification revision.
    Revision(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub condition: Condition,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
    Expire,
}

/// A single change observed by [`Store::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value for puts.
    pub value: Option<String>,
    /// Value before the change, when the key existed.
    pub previous: Option<String>,
    pub revision: u64,
}

/// Hierarchical key-value store with CAS, TTL keys, and ordered watches.
///
/// Prefix arguments name directories and end with `/`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Every key below `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> StoreResult<KeyValue>;

    /// Delete `key`, returning its last value. Fails with `NotFound` when
    /// the key does not exist.
    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<KeyValue>;

    /// Delete every key below `prefix`. Missing prefixes are not an error.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;

    /// Wait for the first change below `prefix` with a revision greater
    /// than `after_revision`. Dropping the future cancels the wait.
    async fn watch(&self, prefix: &str, after_revision: u64) -> StoreResult<WatchEvent>;

    /// Current global revision.
    async fn revision(&self) -> StoreResult<u64>;
}
