//! Simulated failure gate that every keeper operation passes through.
//!
//! One [`FaultInjector`] is shared by the whole cluster for a session.
//! It decides per call whether a keeper operation is dropped or merely
//! stalled, and how far the keeper's clock reads ahead of true time.
//! The clock offset is resampled on every read rather than fixed per
//! keeper, which is the hostile environment the lease-expiry logic is
//! exercised against.

use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// Simulated network and clock behaviour for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct FaultConfig {
    /// Independent probability in `[0, 1]` that a keeper operation
    /// fails outright.
    pub failure_probability: f64,
    /// Minimum injected latency per keeper operation.
    pub min_delay: Duration,
    /// Maximum injected latency per keeper operation.
    pub max_delay: Duration,
    /// Upper bound on the random offset added to keeper clock reads.
    pub max_clock_offset: Duration,
}

impl FaultConfig {
    /// No failures, no latency, perfectly synced clocks.
    #[must_use]
    pub fn ideal() -> Self {
        Self {
            failure_probability: 0.0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_clock_offset: Duration::ZERO,
        }
    }
}

/// A keeper operation was dropped by the failure gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkError;

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("injected network failure")
    }
}

impl std::error::Error for NetworkError {}

/// Shared per-session fault source.
///
/// The active [`FaultConfig`] can be swapped at runtime; the harness
/// uses that to seed a session's faults and to flip to
/// [`FaultConfig::ideal`] for the closing audit read.
pub struct FaultInjector {
    config: RwLock<FaultConfig>,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    /// Create an injector with OS-seeded randomness.
    #[must_use]
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config: RwLock::new(config),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create an injector with a seeded RNG for reproducible failure,
    /// delay and skew schedules.
    #[must_use]
    pub fn with_seed(config: FaultConfig, seed: u64) -> Self {
        Self {
            config: RwLock::new(config),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn config(&self) -> FaultConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the active configuration for all subsequent calls.
    pub fn reconfigure(&self, config: FaultConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Gate one keeper operation: fail it with the configured
    /// probability, otherwise stall it for a uniform duration in
    /// `[min_delay, max_delay]`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] when the draw fails the operation. A
    /// failed operation does not sleep.
    pub async fn network_op(&self) -> Result<(), NetworkError> {
        let (failed, delay) = {
            let config = self.config.read().unwrap();
            let mut rng = self.rng.lock().unwrap();
            let failed = biased_bool(&mut rng, config.failure_probability);
            let delay = if failed {
                Duration::ZERO
            } else {
                uniform_duration(&mut rng, config.min_delay, config.max_delay)
            };
            (failed, delay)
        };

        if failed {
            return Err(NetworkError);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// The keeper-observed current time: true now plus a uniform offset
    /// in `[0, max_clock_offset]`, resampled on every call.
    #[must_use]
    pub fn now(&self) -> Instant {
        let offset = {
            let config = self.config.read().unwrap();
            let mut rng = self.rng.lock().unwrap();
            uniform_duration(&mut rng, Duration::ZERO, config.max_clock_offset)
        };
        Instant::now() + offset
    }
}

/// Draw `true` with the given probability. `p <= 0` and `p >= 1` (and a
/// NaN probability, treated as never) skip the RNG so they hold exactly.
fn biased_bool(rng: &mut StdRng, probability: f64) -> bool {
    if !(probability > 0.0) {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rng.random_bool(probability)
}

/// Uniform duration in `[min, max]`, both inclusive. A zero `max`
/// short-circuits so the ideal configuration never touches the RNG.
fn uniform_duration(rng: &mut StdRng, min: Duration, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rng.random_range(min.as_nanos()..=max.as_nanos());
    Duration::new(
        u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX),
        u32::try_from(nanos % 1_000_000_000).unwrap_or(0),
    )
}
