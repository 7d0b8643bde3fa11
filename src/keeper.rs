//! In-memory storage node for the replicated register.
//!
//! A keeper owns one record per key plus a lease table granting a
//! single writer at a time exclusive access to a key. Both live behind
//! one reader/writer lock: reads share it, the three mutating
//! operations hold it exclusively. The fault gate fires inside the
//! critical section so injected latency counts against lock tenure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::core::Record;
use crate::faults::{FaultInjector, NetworkError};

/// How long a write lease lives before any other writer may claim the
/// key. Generous relative to a coordinator round-trip: leases exist to
/// reclaim keys from crashed writers, not to bound concurrency.
pub const LEASE_TTL: Duration = Duration::from_secs(60);

/// Errors returned by keeper operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeeperError {
    /// The operation was dropped by the fault gate.
    Network(NetworkError),
    /// Another writer holds a live lease on the key.
    KeyLocked,
    /// No live lease exists for the key.
    NotLocked,
    /// A lease exists but was issued to a different `lock_id`.
    LockIdMismatch,
}

impl fmt::Display for KeeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeeperError::Network(e) => write!(f, "{e}"),
            KeeperError::KeyLocked => f.write_str("key already locked"),
            KeeperError::NotLocked => f.write_str("key not locked"),
            KeeperError::LockIdMismatch => f.write_str("lock id does not match"),
        }
    }
}

impl std::error::Error for KeeperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeeperError::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NetworkError> for KeeperError {
    fn from(e: NetworkError) -> Self {
        KeeperError::Network(e)
    }
}

/// Exclusive write permit on one key, expiring on the keeper's clock.
#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct KeeperState<V> {
    records: HashMap<String, Record<V>>,
    leases: HashMap<String, Lease>,
}

/// One of the N symmetric storage nodes in a cluster.
pub struct Keeper<V> {
    state: RwLock<KeeperState<V>>,
    faults: Arc<FaultInjector>,
}

impl<V> Keeper<V>
where
    V: Clone + Default,
{
    /// Create an empty keeper gated by the given fault source.
    #[must_use]
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            state: RwLock::new(KeeperState {
                records: HashMap::new(),
                leases: HashMap::new(),
            }),
            faults,
        }
    }

    /// Read the record for `key`, synthesizing an unwritten record if
    /// the keeper has never stored one. Never consults the lease table:
    /// reads during an in-flight write see either the old or the new
    /// record, and the coordinator's classification absorbs that.
    ///
    /// # Errors
    ///
    /// [`KeeperError::Network`] when the fault gate drops the call.
    pub async fn get(&self, key: &str) -> Result<Record<V>, KeeperError> {
        let state = self.state.read().await;
        self.faults.network_op().await?;

        Ok(state
            .records
            .get(key)
            .cloned()
            .unwrap_or_else(|| Record::absent(key)))
    }

    /// Atomically claim the write lease on `key` and read its record.
    ///
    /// An existing lease only blocks the claim while it is live on this
    /// keeper's (skewed) clock; an expired lease is silently replaced.
    ///
    /// # Errors
    ///
    /// [`KeeperError::Network`] when the fault gate drops the call (no
    /// lease is installed), [`KeeperError::KeyLocked`] when another
    /// writer's lease is still live.
    pub async fn get_and_lock(&self, key: &str, lock_id: &str) -> Result<Record<V>, KeeperError> {
        let mut state = self.state.write().await;
        self.faults.network_op().await?;

        if let Some(lease) = state.leases.get(key)
            && self.faults.now() <= lease.expires_at
        {
            trace!(key, "lease claim rejected, key already leased");
            return Err(KeeperError::KeyLocked);
        }

        state.leases.insert(
            key.to_owned(),
            Lease {
                holder: lock_id.to_owned(),
                expires_at: self.faults.now() + LEASE_TTL,
            },
        );
        trace!(key, lock_id, "lease installed");

        Ok(state
            .records
            .get(key)
            .cloned()
            .unwrap_or_else(|| Record::absent(key)))
    }

    /// Atomically overwrite the record for `key` and release the lease,
    /// provided the caller still holds a live lease on it.
    ///
    /// # Errors
    ///
    /// [`KeeperError::Network`] when the fault gate drops the call,
    /// [`KeeperError::NotLocked`] when no lease exists or the caller's
    /// lease has expired on this keeper's clock,
    /// [`KeeperError::LockIdMismatch`] when the lease belongs to a
    /// different writer.
    pub async fn set_and_unlock(
        &self,
        key: &str,
        record: Record<V>,
        lock_id: &str,
    ) -> Result<(), KeeperError> {
        let mut state = self.state.write().await;
        self.faults.network_op().await?;

        let Some(lease) = state.leases.get(key) else {
            return Err(KeeperError::NotLocked);
        };
        if self.faults.now() > lease.expires_at {
            trace!(key, lock_id, "write rejected, lease expired");
            return Err(KeeperError::NotLocked);
        }
        if lease.holder != lock_id {
            return Err(KeeperError::LockIdMismatch);
        }

        state.leases.remove(key);
        trace!(key, lock_id, version = record.version, "record written");
        state.records.insert(key.to_owned(), record);
        Ok(())
    }

    /// Release the lease on `key` if the caller holds it. Releasing a
    /// key that is not leased succeeds, so cleanup can be fired blindly
    /// at every keeper. Expiry is deliberately not checked: releasing
    /// an expired lease you own is permitted.
    ///
    /// # Errors
    ///
    /// [`KeeperError::Network`] when the fault gate drops the call,
    /// [`KeeperError::LockIdMismatch`] when the lease belongs to a
    /// different writer.
    pub async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), KeeperError> {
        let mut state = self.state.write().await;
        self.faults.network_op().await?;

        match state.leases.get(key) {
            None => Ok(()),
            Some(lease) if lease.holder != lock_id => Err(KeeperError::LockIdMismatch),
            Some(_) => {
                state.leases.remove(key);
                trace!(key, lock_id, "lease released");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultConfig;

    fn keeper() -> Keeper<String> {
        Keeper::new(Arc::new(FaultInjector::with_seed(FaultConfig::ideal(), 7)))
    }

    fn record(version: i64, unconfirmed: &str) -> Record<String> {
        Record {
            key: "state".to_owned(),
            confirmed_value: String::new(),
            unconfirmed_value: unconfirmed.to_owned(),
            version,
            signature: "sig".to_owned(),
        }
    }

    #[tokio::test]
    async fn get_synthesizes_unwritten_record() {
        let keeper = keeper();
        let rec = keeper.get("state").await.unwrap();
        assert_eq!(rec.version, crate::core::UNWRITTEN);
        assert_eq!(rec.signature, "");
        assert_eq!(rec.unconfirmed_value, "");
    }

    #[tokio::test]
    async fn lease_blocks_second_writer() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();
        assert_eq!(
            keeper.get_and_lock("state", "b").await,
            Err(KeeperError::KeyLocked)
        );
    }

    #[tokio::test]
    async fn get_ignores_live_leases() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();
        assert!(keeper.get("state").await.is_ok());
    }

    #[tokio::test]
    async fn write_requires_matching_lease() {
        let keeper = keeper();
        assert_eq!(
            keeper.set_and_unlock("state", record(0, "x"), "a").await,
            Err(KeeperError::NotLocked)
        );

        keeper.get_and_lock("state", "a").await.unwrap();
        assert_eq!(
            keeper.set_and_unlock("state", record(0, "x"), "b").await,
            Err(KeeperError::LockIdMismatch)
        );

        keeper
            .set_and_unlock("state", record(0, "x"), "a")
            .await
            .unwrap();
        assert_eq!(keeper.get("state").await.unwrap().unconfirmed_value, "x");
    }

    #[tokio::test]
    async fn two_writers_cannot_both_write() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();
        keeper
            .set_and_unlock("state", record(0, "first"), "a")
            .await
            .unwrap();

        // The write released the lease, so a straggler with a stale
        // lock id finds nothing to write under.
        assert_eq!(
            keeper.set_and_unlock("state", record(0, "late"), "b").await,
            Err(KeeperError::NotLocked)
        );
        assert_eq!(keeper.get("state").await.unwrap().unconfirmed_value, "first");
    }

    #[tokio::test]
    async fn unlock_is_idempotent() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();
        keeper.unlock("state", "a").await.unwrap();
        keeper.unlock("state", "a").await.unwrap();
        keeper.unlock("state", "b").await.unwrap();
    }

    #[tokio::test]
    async fn unlock_rejects_foreign_lease() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();
        assert_eq!(
            keeper.unlock("state", "b").await,
            Err(KeeperError::LockIdMismatch)
        );
        // The holder can still release and rewrite later.
        keeper.unlock("state", "a").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimable() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();

        tokio::time::advance(LEASE_TTL + Duration::from_secs(1)).await;

        // A new writer claims the key over the dead lease...
        keeper.get_and_lock("state", "b").await.unwrap();
        // ...and the original holder can no longer write.
        assert_eq!(
            keeper.set_and_unlock("state", record(0, "x"), "a").await,
            Err(KeeperError::LockIdMismatch)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_holder_cannot_write() {
        let keeper = keeper();
        keeper.get_and_lock("state", "a").await.unwrap();

        tokio::time::advance(LEASE_TTL + Duration::from_secs(1)).await;

        assert_eq!(
            keeper.set_and_unlock("state", record(0, "x"), "a").await,
            Err(KeeperError::NotLocked)
        );
        // Releasing the expired lease you own is still permitted.
        keeper.unlock("state", "a").await.unwrap();
    }

    #[tokio::test]
    async fn dropped_claim_installs_no_lease() {
        let faults = Arc::new(FaultInjector::with_seed(
            FaultConfig {
                failure_probability: 1.0,
                ..FaultConfig::ideal()
            },
            7,
        ));
        let keeper: Keeper<String> = Keeper::new(Arc::clone(&faults));

        assert_eq!(
            keeper.get_and_lock("state", "a").await,
            Err(KeeperError::Network(crate::faults::NetworkError))
        );

        // Heal the network: the key must be claimable by anyone.
        faults.reconfigure(FaultConfig::ideal());
        keeper.get_and_lock("state", "b").await.unwrap();
    }
}
