//! TTL leases on single keys.
//!
//! A lease is held by whoever created its key; it is kept alive by
//! revision-guarded refreshes and dies with its TTL. The engine elects its
//! leader with the [`ENGINE_LEASE`] lease.

use std::sync::Arc;
use std::time::Duration;

use armada_store::{Condition, KeyValue, PutOptions, Store, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::keys::KeySpace;

pub const ENGINE_LEASE: &str = "engine-leader";

/// Stored lease value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    machine_id: String,
    version: String,
}

/// A lease as observed at a store revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    /// Machine id of the holder.
    pub holder: String,
    /// Software version of the holder.
    pub version: String,
    /// Remaining time to live when observed.
    pub ttl: Duration,
    /// Store revision of the last write; the renew/release guard.
    pub revision: u64,
}

impl Lease {
    fn from_kv(name: &str, kv: &KeyValue, ttl: Duration) -> RegistryResult<Self> {
        let record: LeaseRecord = serde_json::from_str(&kv.value)
            .map_err(|e| RegistryError::Fatal(format!("lease {name}: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            holder: record.machine_id,
            version: record.version,
            ttl: kv.ttl.unwrap_or(ttl),
            revision: kv.mod_revision,
        })
    }

    fn record(&self) -> LeaseRecord {
        LeaseRecord {
            machine_id: self.holder.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Create the lease key. Returns `None` when someone else holds it.
    pub async fn acquire(
        &self,
        name: &str,
        holder: &str,
        version: &str,
        ttl: Duration,
    ) -> RegistryResult<Option<Lease>> {
        let record = LeaseRecord {
            machine_id: holder.to_string(),
            version: version.to_string(),
        };
        let value = serde_json::to_string(&record).map_err(|e| RegistryError::Fatal(e.to_string()))?;
        let opts = PutOptions::new().with_ttl(ttl).with_condition(Condition::Absent);

        match self.store.put(&self.keys.lease(name), &value, opts).await {
            Ok(kv) => {
                info!(lease = %name, %holder, revision = kv.mod_revision, "lease acquired");
                Lease::from_kv(name, &kv, ttl).map(Some)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(lease = %name, %holder, "lease held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh a held lease. Fails with `Precondition` once the revision has
    /// moved or the lease expired.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> RegistryResult<Lease> {
        let value =
            serde_json::to_string(&lease.record()).map_err(|e| RegistryError::Fatal(e.to_string()))?;
        let opts = PutOptions::new()
            .with_ttl(ttl)
            .with_condition(Condition::Revision(lease.revision));

        match self.store.put(&self.keys.lease(&lease.name), &value, opts).await {
            Ok(kv) => Lease::from_kv(&lease.name, &kv, ttl),
            Err(StoreError::NotFound(_)) | Err(StoreError::CompareFailed { .. }) => Err(
                RegistryError::Precondition(format!("lease {} lost by {}", lease.name, lease.holder)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease up if still held at the same revision.
    pub async fn release(&self, lease: &Lease) -> RegistryResult<()> {
        match self
            .store
            .delete(&self.keys.lease(&lease.name), Condition::Revision(lease.revision))
            .await
        {
            Ok(_) => {
                info!(lease = %lease.name, holder = %lease.holder, "lease released");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(StoreError::CompareFailed { .. }) => Err(RegistryError::Precondition(format!(
                "lease {} no longer held by {}",
                lease.name, lease.holder
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Current holder, if any.
    pub async fn get(&self, name: &str) -> RegistryResult<Option<Lease>> {
        match self.store.get(&self.keys.lease(name)).await? {
            Some(kv) => Lease::from_kv(name, &kv, Duration::ZERO).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use armada_store::MemStore;

    use super::*;

    fn manager() -> LeaseManager {
        LeaseManager::new(Arc::new(MemStore::new()), KeySpace::default())
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let leases = manager();
        let held = leases.acquire(ENGINE_LEASE, "m1", "0.1.0", TTL).await.unwrap();
        assert!(held.is_some());
        assert!(leases.acquire(ENGINE_LEASE, "m2", "0.1.0", TTL).await.unwrap().is_none());

        let current = leases.get(ENGINE_LEASE).await.unwrap().unwrap();
        assert_eq!(current.holder, "m1");
        assert_eq!(current.version, "0.1.0");
    }

    #[tokio::test]
    async fn renew_advances_revision() {
        let leases = manager();
        let lease = leases.acquire(ENGINE_LEASE, "m1", "v", TTL).await.unwrap().unwrap();
        let renewed = leases.renew(&lease, TTL).await.unwrap();
        assert!(renewed.revision > lease.revision);

        // The stale copy can no longer renew or release.
        assert!(matches!(
            leases.renew(&lease, TTL).await,
            Err(RegistryError::Precondition(_))
        ));
        assert!(matches!(leases.release(&lease).await, Err(RegistryError::Precondition(_))));

        leases.release(&renewed).await.unwrap();
        assert!(leases.get(ENGINE_LEASE).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let leases = manager();
        let old = leases.acquire(ENGINE_LEASE, "m1", "v", TTL).await.unwrap().unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(leases.get(ENGINE_LEASE).await.unwrap().is_none());
        let new = leases.acquire(ENGINE_LEASE, "m2", "v", TTL).await.unwrap().unwrap();
        assert_eq!(new.holder, "m2");
        assert!(matches!(leases.renew(&old, TTL).await, Err(RegistryError::Precondition(_))));
    }

    #[tokio::test]
    async fn release_of_missing_lease_is_ok() {
        let leases = manager();
        let lease = leases.acquire("other", "m1", "v", TTL).await.unwrap().unwrap();
        leases.release(&lease).await.unwrap();
        leases.release(&lease).await.unwrap();
    }
}
