//! Session harness: round-robin writers plus a post-session audit read.
//!
//! A session fires a configured number of concurrent writes at the
//! cluster through the fault gate, records each outcome in completion
//! order, then flips the gate to ideal conditions and reads the
//! register back. The read must return the value of the last write that
//! was acknowledged, in completion order - that is the consensus the
//! engine promises.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use rand::distr::{Alphanumeric, SampleString};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};

use crate::coordinator::Coordinator;
use crate::faults::{FaultConfig, FaultInjector};
use crate::keeper::Keeper;

/// Length of the random values the harness writes.
const VALUE_LEN: usize = 12;

/// Parameters of one harness session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Total number of writes to dispatch. At least 2.
    pub request_count: usize,
    /// Spacing between consecutive dispatches. Without it every write
    /// would start in the same instant and their true order would be
    /// undetectable.
    pub request_interval: Duration,
    /// Fault behaviour active while the writes run.
    pub faults: FaultConfig,
}

impl SessionConfig {
    /// A small lively session: ten writes a microsecond apart over a
    /// network that drops a tenth of all calls, stalls the rest for up
    /// to a millisecond and skews keeper clocks by up to ten
    /// milliseconds.
    #[must_use]
    pub fn quickstart() -> Self {
        Self {
            request_count: 10,
            request_interval: Duration::from_micros(1),
            faults: FaultConfig {
                failure_probability: 0.1,
                min_delay: Duration::from_micros(100),
                max_delay: Duration::from_millis(1),
                max_clock_offset: Duration::from_millis(10),
            },
        }
    }

    /// Check the configuration before a session starts.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), Report<SessionError>> {
        if self.request_count < 2 {
            return Err(Report::new(SessionError::InvalidConfig)
                .attach_printable("request count must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.faults.failure_probability) {
            return Err(Report::new(SessionError::InvalidConfig)
                .attach_printable("network failure probability must be in the interval [0, 1]"));
        }
        if self.faults.min_delay > self.faults.max_delay {
            return Err(Report::new(SessionError::InvalidConfig)
                .attach_printable("network min delay must be <= network max delay"));
        }
        Ok(())
    }
}

/// Ways a session can fail.
#[derive(Debug)]
pub enum SessionError {
    /// The configuration was rejected before any write was dispatched.
    InvalidConfig,
    /// The closing audit read errored even under ideal conditions.
    AuditRead,
    /// The audit read disagreed with the last acknowledged write.
    ConsensusBroken {
        /// Value of the last write acknowledged in completion order.
        expected: String,
        /// Value the audit read actually returned.
        actual: String,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidConfig => f.write_str("invalid session config"),
            SessionError::AuditRead => f.write_str("audit read failed after the session"),
            SessionError::ConsensusBroken { expected, actual } => write!(
                f,
                "consensus broken: expected state {expected:?}, but got {actual:?}"
            ),
        }
    }
}

impl std::error::Error for SessionError {}

/// Build a cluster of `size` keepers sharing one fault gate, with one
/// coordinator handle per keeper. Every coordinator sees the full
/// keeper set; the peers are fully symmetric.
#[must_use]
pub fn cluster<V>(size: usize, faults: &Arc<FaultInjector>) -> Vec<Coordinator<V>>
where
    V: Clone + Default,
{
    let keepers: Vec<Arc<Keeper<V>>> = (0..size)
        .map(|_| Arc::new(Keeper::new(Arc::clone(faults))))
        .collect();
    (0..size).map(|_| Coordinator::new(keepers.clone())).collect()
}

/// Run one session against the given coordinators.
///
/// Seeds the fault gate from the config, dispatches `request_count`
/// staggered concurrent writes round-robin over the coordinators, then
/// swaps the gate to [`FaultConfig::ideal`] and audits the register
/// through the first coordinator.
///
/// # Errors
///
/// [`SessionError::InvalidConfig`] before anything runs,
/// [`SessionError::AuditRead`] when the closing read errors, and
/// [`SessionError::ConsensusBroken`] when it returns anything other
/// than the last acknowledged value.
#[instrument(skip_all, fields(requests = config.request_count))]
pub async fn run_session(
    config: &SessionConfig,
    coordinators: &[Coordinator<String>],
    faults: &FaultInjector,
) -> Result<(), Report<SessionError>> {
    config.validate()?;
    if coordinators.is_empty() {
        return Err(Report::new(SessionError::InvalidConfig)
            .attach_printable("at least one coordinator instance is required"));
    }

    faults.reconfigure(config.faults.clone());

    // Writers report here the moment they finish; the channel order is
    // the completion order the audit read is checked against.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    for request in 0..config.request_count {
        let coordinator = coordinators[request % coordinators.len()].clone();
        let done_tx = done_tx.clone();
        let value = Alphanumeric.sample_string(&mut rand::rng(), VALUE_LEN);

        trace!(request, %value, "dispatching write");
        tokio::spawn(async move {
            let outcome = coordinator.set(value.clone()).await;
            let _ = done_tx.send((value, outcome));
        });

        if !config.request_interval.is_zero() {
            tokio::time::sleep(config.request_interval).await;
        }
    }
    drop(done_tx);

    let mut acknowledged = 0usize;
    let mut expected = String::new();
    while let Some((value, outcome)) = done_rx.recv().await {
        match outcome {
            Ok(()) => {
                acknowledged += 1;
                expected = value;
            }
            Err(error) => trace!(%value, %error, "write not acknowledged"),
        }
    }
    debug!(
        acknowledged,
        rejected = config.request_count - acknowledged,
        "all writes settled"
    );

    // The audit read runs over a perfect network so the only thing
    // under test is the state the protocol left behind.
    faults.reconfigure(FaultConfig::ideal());

    let actual = coordinators[0]
        .get()
        .await
        .map_err(|error| Report::new(SessionError::AuditRead).attach_printable(error))?;

    if actual == expected {
        debug!(state = %expected, "session passed");
        Ok(())
    } else {
        Err(Report::new(SessionError::ConsensusBroken { expected, actual }))
    }
}
