//! In-process store.
//!
//! Keys live in a `BTreeMap` behind a tokio mutex. Every write bumps a
//! global revision and appends to a bounded event history that watches
//! replay from. TTL keys are expired lazily on each call, and watchers
//! sleep until the nearest expiry so they observe it on time. Expiry uses
//! `tokio::time::Instant`, so tests can drive it with a paused clock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::{Condition, KeyValue, PutOptions, Store, WatchEvent, WatchEventKind};

/// Events retained for watchers that fall behind.
pub const HISTORY_LIMIT: usize = 1000;

struct Entry {
    value: String,
    create_revision: u64,
    mod_revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn to_key_value(&self, key: &str, now: Instant) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            ttl: self.expires_at.map(|at| at.saturating_duration_since(now)),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    /// Highest revision dropped from `history`.
    cleared_through: u64,
}

impl Inner {
    fn record(
        &mut self,
        kind: WatchEventKind,
        key: &str,
        value: Option<String>,
        previous: Option<String>,
    ) -> u64 {
        self.revision += 1;
        self.history.push_back(WatchEvent {
            kind,
            key: key.to_string(),
            value,
            previous,
            revision: self.revision,
        });
        if self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.revision;
            }
        }
        self.revision
    }

    fn expire(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                debug!(%key, "key expired");
                self.record(WatchEventKind::Expire, key, None, Some(entry.value));
            }
        }
        !expired.is_empty()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.expires_at).min()
    }

    fn under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

fn check(key: &str, existing: Option<&Entry>, condition: &Condition) -> StoreResult<()> {
    match (condition, existing) {
        (Condition::None, _) => Ok(()),
        (Condition::Absent, None) => Ok(()),
        (Condition::Absent, Some(_)) => Err(StoreError::AlreadyExists(key.to_string())),
        (_, None) => Err(StoreError::NotFound(key.to_string())),
        (Condition::Present, Some(_)) => Ok(()),
        (Condition::Value(want), Some(e)) if &e.value == want => Ok(()),
        (Condition::Value(want), Some(e)) => Err(StoreError::CompareFailed {
            key: key.to_string(),
            reason: format!("value is {:?}, expected {:?}", e.value, want),
        }),
        (Condition::Revision(want), Some(e)) if e.mod_revision == *want => Ok(()),
        (Condition::Revision(want), Some(e)) => Err(StoreError::CompareFailed {
            key: key.to_string(),
            reason: format!("revision is {}, expected {}", e.mod_revision, want),
        }),
    }
}

/// In-process [`Store`]. Clones share the same data.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes: Arc::new(changes),
        }
    }

    fn notify(&self, revision: u64) {
        self.changes.send_replace(revision);
    }

    /// Expire due keys and return the guard, notifying watchers if any expired.
    async fn lock(&self) -> (tokio::sync::MutexGuard<'_, Inner>, Instant) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.expire(now) {
            self.notify(inner.revision);
        }
        (inner, now)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let (inner, now) = self.lock().await;
        Ok(inner.entries.get(key).map(|e| e.to_key_value(key, now)))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let (inner, now) = self.lock().await;
        Ok(inner.under(prefix).map(|(k, e)| e.to_key_value(k, now)).collect())
    }

    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> StoreResult<KeyValue> {
        let (mut inner, now) = self.lock().await;
        let existing = inner.entries.get(key);
        check(key, existing, &opts.condition)?;

        let previous = existing.map(|e| e.value.clone());
        let create_revision = existing.map(|e| e.create_revision);
        let revision = inner.record(WatchEventKind::Put, key, Some(value.to_string()), previous);

        let entry = Entry {
            value: value.to_string(),
            create_revision: create_revision.unwrap_or(revision),
            mod_revision: revision,
            expires_at: opts.ttl.map(|ttl| now + ttl),
        };
        let kv = entry.to_key_value(key, now);
        inner.entries.insert(key.to_string(), entry);
        drop(inner);

        self.notify(revision);
        Ok(kv)
    }

    async fn delete(&self, key: &str, condition: Condition) -> StoreResult<KeyValue> {
        let (mut inner, now) = self.lock().await;
        let existing = inner.entries.get(key);
        if existing.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        check(key, existing, &condition)?;

        let Some(entry) = inner.entries.remove(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let mut kv = entry.to_key_value(key, now);
        let revision = inner.record(WatchEventKind::Delete, key, None, Some(entry.value));
        kv.mod_revision = revision;
        drop(inner);

        self.notify(revision);
        Ok(kv)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let (mut inner, _) = self.lock().await;
        let keys: Vec<String> = inner.under(prefix).map(|(k, _)| k.clone()).collect();
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                inner.record(WatchEventKind::Delete, key, None, Some(entry.value));
            }
        }
        let revision = inner.revision;
        drop(inner);

        if !keys.is_empty() {
            self.notify(revision);
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> StoreResult<WatchEvent> {
        let mut changes = self.changes.subscribe();
        loop {
            let deadline = {
                let (inner, _) = self.lock().await;
                if after_revision < inner.cleared_through {
                    return Err(StoreError::IndexCleared(after_revision));
                }
                if let Some(event) = inner
                    .history
                    .iter()
                    .find(|e| e.revision > after_revision && e.key.starts_with(prefix))
                {
                    return Ok(event.clone());
                }
                inner.next_expiry()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        res = changes.changed() => {
                            res.map_err(|_| StoreError::Unavailable("store closed".to_string()))?;
                        }
                        _ = tokio::time::sleep_until(at + Duration::from_millis(1)) => {}
                    }
                }
                None => changes
                    .changed()
                    .await
                    .map_err(|_| StoreError::Unavailable("store closed".to_string()))?,
            }
        }
    }

    async fn revision(&self) -> StoreResult<u64> {
        let (inner, _) = self.lock().await;
        Ok(inner.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> PutOptions {
        PutOptions::new()
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemStore::new();
        let kv = store.put("/a/b", "1", opts()).await.unwrap();
        assert_eq!(kv.mod_revision, 1);
        assert_eq!(kv.create_revision, 1);

        let got = store.get("/a/b").await.unwrap().unwrap();
        assert_eq!(got.value, "1");
        assert_eq!(got.ttl, None);
        assert!(store.get("/a/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_refuses_existing_key() {
        let store = MemStore::new();
        let create = opts().with_condition(Condition::Absent);
        store.put("/k", "1", create.clone()).await.unwrap();
        let err = store.put("/k", "2", create).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("/k".to_string()));
    }

    #[tokio::test]
    async fn update_requires_existing_key() {
        let store = MemStore::new();
        let update = opts().with_condition(Condition::Present);
        assert!(matches!(
            store.put("/k", "1", update).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_swap_on_value_and_revision() {
        let store = MemStore::new();
        let kv = store.put("/k", "a", opts()).await.unwrap();

        let wrong_value = opts().with_condition(Condition::Value("b".into()));
        assert!(matches!(
            store.put("/k", "x", wrong_value).await,
            Err(StoreError::CompareFailed { .. })
        ));

        let by_rev = opts().with_condition(Condition::Revision(kv.mod_revision));
        let kv2 = store.put("/k", "c", by_rev.clone()).await.unwrap();
        assert_eq!(kv2.create_revision, kv.create_revision);
        assert!(kv2.mod_revision > kv.mod_revision);

        // The old revision no longer matches.
        assert!(matches!(
            store.put("/k", "d", by_rev).await,
            Err(StoreError::CompareFailed { .. })
        ));
    }

    #[tokio::test]
    async fn delete_honours_conditions() {
        let store = MemStore::new();
        store.put("/k", "a", opts()).await.unwrap();
        assert!(matches!(
            store.delete("/k", Condition::Value("b".into())).await,
            Err(StoreError::CompareFailed { .. })
        ));
        let deleted = store.delete("/k", Condition::Value("a".into())).await.unwrap();
        assert_eq!(deleted.value, "a");
        assert!(matches!(
            store.delete("/k", Condition::None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_returns_sorted_keys_under_prefix() {
        let store = MemStore::new();
        store.put("/p/b", "2", opts()).await.unwrap();
        store.put("/p/a", "1", opts()).await.unwrap();
        store.put("/q/a", "3", opts()).await.unwrap();

        let keys: Vec<_> = store.list("/p/").await.unwrap().into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["/p/a", "/p/b"]);

        store.delete_prefix("/p/").await.unwrap();
        assert!(store.list("/p/").await.unwrap().is_empty());
        assert_eq!(store.list("/q/").await.unwrap().len(), 1);
        store.delete_prefix("/missing/").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_keys_expire() {
        let store = MemStore::new();
        store
            .put("/e", "x", opts().with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();

        let kv = store.get("/e").await.unwrap().unwrap();
        assert_eq!(kv.ttl, Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("/e").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("/e").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refreshing_ttl_extends_life() {
        let store = MemStore::new();
        let ttl = opts().with_ttl(Duration::from_secs(10));
        store.put("/e", "x", ttl.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.put("/e", "x", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("/e").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_replays_history_in_order() {
        let store = MemStore::new();
        store.put("/w/a", "1", opts()).await.unwrap();
        store.put("/x/a", "1", opts()).await.unwrap();
        store.put("/w/b", "2", opts()).await.unwrap();

        let first = store.watch("/w/", 0).await.unwrap();
        assert_eq!(first.key, "/w/a");
        let second = store.watch("/w/", first.revision).await.unwrap();
        assert_eq!(second.key, "/w/b");
        assert_eq!(second.revision, 3);
    }

    #[tokio::test]
    async fn watch_wakes_on_new_write() {
        let store = MemStore::new();
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("/w/", 0).await })
        };
        tokio::task::yield_now().await;
        store.put("/w/a", "1", opts()).await.unwrap();

        let event = watcher.await.unwrap().unwrap();
        assert_eq!(event.kind, WatchEventKind::Put);
        assert_eq!(event.value.as_deref(), Some("1"));
        assert_eq!(event.previous, None);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_observes_expiry() {
        let store = MemStore::new();
        let kv = store
            .put("/w/e", "x", opts().with_ttl(Duration::from_secs(5)))
            .await
            .unwrap();
        let event = store.watch("/w/", kv.mod_revision).await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Expire);
        assert_eq!(event.previous.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn watch_reports_cleared_history() {
        let store = MemStore::new();
        for i in 0..(HISTORY_LIMIT + 5) {
            store.put("/h", &i.to_string(), opts()).await.unwrap();
        }
        assert_eq!(store.watch("/", 1).await, Err(StoreError::IndexCleared(1)));
        let current = store.revision().await.unwrap();
        assert!(store.watch("/", current - 1).await.is_ok());
    }
}
