//! Stateless front-end that drives reads and writes over a keeper set.
//!
//! Every operation fans out to all keepers concurrently, demands a
//! majority of answers, classifies the most recent write from the
//! collected records and acts on the verdict. Writes additionally take
//! the per-keeper lease first and release it on every exit path, so a
//! crashed or rejected attempt never pins the key until lease expiry.

use std::fmt;
use std::sync::Arc;

use futures::future;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::core::{Record, WriteStatus, determine_write_status, smallest_majority};
use crate::keeper::{Keeper, KeeperError};

/// Key of the single logical register the engine replicates.
pub const REGISTER_KEY: &str = "state";

/// Errors returned by [`Coordinator::get`].
#[derive(Debug)]
pub enum GetError {
    /// A majority of keepers failed to answer, or the surviving records
    /// were insufficient to classify the last write.
    QuorumUnavailable {
        /// The individual keeper failures of the round.
        errors: Vec<KeeperError>,
    },
}

impl fmt::Display for GetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetError::QuorumUnavailable { errors } => {
                write!(f, "read quorum unavailable{}", joined(errors))
            }
        }
    }
}

impl std::error::Error for GetError {}

/// Errors returned by [`Coordinator::set`].
#[derive(Debug)]
pub enum SetError {
    /// A majority of keepers refused the lease or failed to answer, or
    /// the surviving records were insufficient to classify the last
    /// write.
    QuorumUnavailable {
        /// The individual keeper failures of the round.
        errors: Vec<KeeperError>,
    },
    /// The record was built but a majority of keepers rejected the
    /// write. Its signature may survive on a minority; the next
    /// writer's classification garbage-collects it.
    QuorumFailed {
        /// The individual keeper failures of the write round.
        errors: Vec<KeeperError>,
    },
}

impl fmt::Display for SetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetError::QuorumUnavailable { errors } => {
                write!(f, "write quorum unavailable{}", joined(errors))
            }
            SetError::QuorumFailed { errors } => {
                write!(f, "write rejected by a majority of keepers{}", joined(errors))
            }
        }
    }
}

impl std::error::Error for SetError {}

fn joined(errors: &[KeeperError]) -> String {
    let mut out = String::new();
    for error in errors {
        out.push_str("\n  ");
        out.push_str(&error.to_string());
    }
    out
}

/// Stateless driver for the replicated register.
///
/// Holds nothing but the fixed keeper set; any number of coordinators
/// may share the same keepers, and a coordinator carries no state
/// between calls.
#[derive(Clone)]
pub struct Coordinator<V> {
    keepers: Vec<Arc<Keeper<V>>>,
}

impl<V> Coordinator<V>
where
    V: Clone + Default,
{
    /// Create a coordinator over the given keeper set.
    #[must_use]
    pub fn new(keepers: Vec<Arc<Keeper<V>>>) -> Self {
        Self { keepers }
    }

    fn quorum(&self) -> usize {
        smallest_majority(self.keepers.len())
    }

    /// Read the register.
    ///
    /// Collects the record from every keeper, classifies the most
    /// recent write and returns the unconfirmed value if it committed,
    /// the confirmed value if it provably failed.
    ///
    /// # Errors
    ///
    /// [`GetError::QuorumUnavailable`] when a majority of keepers
    /// failed to answer or the classification stayed unresolved.
    #[instrument(skip_all)]
    pub async fn get(&self) -> Result<V, GetError> {
        let responses =
            future::join_all(self.keepers.iter().map(|k| k.get(REGISTER_KEY))).await;
        let (records, errors) = partition(responses);

        if errors.len() >= self.quorum() {
            warn!(failed = errors.len(), "read round lost its quorum");
            return Err(GetError::QuorumUnavailable { errors });
        }

        match determine_write_status(&records, self.keepers.len()) {
            WriteStatus::Success(record) => Ok(record.unconfirmed_value),
            WriteStatus::Failure(record) => Ok(record.confirmed_value),
            WriteStatus::Unknown => {
                debug!("last write unresolved, refusing to answer");
                Err(GetError::QuorumUnavailable { errors })
            }
        }
    }

    /// Write the register.
    ///
    /// Takes the lease on every reachable keeper, classifies the most
    /// recent write, then writes a successor record: on a committed
    /// predecessor the version advances and the predecessor's value is
    /// promoted to confirmed; on a provably failed predecessor the
    /// version slot is reused. Leases are released on every exit path.
    ///
    /// # Errors
    ///
    /// [`SetError::QuorumUnavailable`] when the collect phase lost its
    /// majority or the classification stayed unresolved;
    /// [`SetError::QuorumFailed`] when a majority of keepers rejected
    /// the write itself.
    #[instrument(skip_all)]
    pub async fn set(&self, value: V) -> Result<(), SetError> {
        let lock_id = Uuid::new_v4().to_string();
        debug!(%lock_id, "acquiring write leases");

        let responses = future::join_all(
            self.keepers
                .iter()
                .map(|k| k.get_and_lock(REGISTER_KEY, &lock_id)),
        )
        .await;
        let (records, errors) = partition(responses);

        let result = self.write_classified(value, &lock_id, records, errors).await;

        // Blind cleanup: release leases everywhere, including keepers
        // whose write never landed. Keepers that already applied the
        // write treat this as a no-op, and failures here are harmless
        // because expiry reclaims anything we miss.
        let released = future::join_all(
            self.keepers
                .iter()
                .map(|k| k.unlock(REGISTER_KEY, &lock_id)),
        )
        .await;
        trace!(
            released = released.iter().filter(|r| r.is_ok()).count(),
            "lease cleanup finished"
        );

        result
    }

    async fn write_classified(
        &self,
        value: V,
        lock_id: &str,
        records: Vec<Record<V>>,
        errors: Vec<KeeperError>,
    ) -> Result<(), SetError> {
        if errors.len() >= self.quorum() {
            warn!(failed = errors.len(), "lease round lost its quorum");
            return Err(SetError::QuorumUnavailable { errors });
        }

        let record = match determine_write_status(&records, self.keepers.len()) {
            // The previous write committed: promote its value and open
            // the next version slot.
            WriteStatus::Success(current) => Record {
                key: REGISTER_KEY.to_owned(),
                confirmed_value: current.unconfirmed_value,
                unconfirmed_value: value,
                version: current.version + 1,
                signature: Uuid::new_v4().to_string(),
            },
            // The previous write provably failed: keep its confirmed
            // value and reuse the version slot it wasted.
            WriteStatus::Failure(current) => Record {
                key: REGISTER_KEY.to_owned(),
                confirmed_value: current.confirmed_value,
                unconfirmed_value: value,
                version: current.version,
                signature: Uuid::new_v4().to_string(),
            },
            WriteStatus::Unknown => {
                debug!("last write unresolved, refusing to write");
                return Err(SetError::QuorumUnavailable { errors });
            }
        };

        debug!(version = record.version, "writing record to all keepers");
        let responses = future::join_all(
            self.keepers
                .iter()
                .map(|k| k.set_and_unlock(REGISTER_KEY, record.clone(), lock_id)),
        )
        .await;
        let write_errors: Vec<KeeperError> =
            responses.into_iter().filter_map(Result::err).collect();

        if write_errors.len() >= self.quorum() {
            warn!(failed = write_errors.len(), "write round lost its quorum");
            return Err(SetError::QuorumFailed {
                errors: write_errors,
            });
        }

        debug!(version = record.version, "write acknowledged");
        Ok(())
    }
}

fn partition<T>(responses: Vec<Result<T, KeeperError>>) -> (Vec<T>, Vec<KeeperError>) {
    let mut values = Vec::with_capacity(responses.len());
    let mut errors = Vec::new();
    for response in responses {
        match response {
            Ok(value) => values.push(value),
            Err(error) => errors.push(error),
        }
    }
    (values, errors)
}
