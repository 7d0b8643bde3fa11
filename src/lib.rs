//! Replicated single-register consensus engine with a built-in
//! fault-injection harness.
//!
//! A cluster of N symmetric keepers each hold one versioned record for
//! the register. Stateless coordinators drive reads and writes over the
//! whole set: collect a majority of records, infer whether the most
//! recent write committed, then act on the verdict - a read returns the
//! appropriate value, a write takes per-keeper leases and installs a
//! successor record that simultaneously promotes the previous value and
//! proposes the new one. Reads and writes either return a result
//! consistent with one linear history or they fail; availability is
//! sacrificed, agreement never is.
//!
//! # Architecture
//!
//! - **Keepers** ([`keeper`]): in-memory record store plus a lease
//!   table enforcing single-writer access per key.
//! - **Coordinators** ([`coordinator`]): quorum fan-out, last-write
//!   classification ([`core`]) and two-phase value promotion.
//! - **Fault gate** ([`faults`]): per-call injected failures, latency
//!   and clock skew that every keeper operation passes through.
//! - **Harness** ([`session`]): concurrent round-robin writers, a
//!   completion-order oracle and the closing audit read.
//!
//! # Quick Start
//!
//! ```ignore
//! let config = SessionConfig::quickstart();
//! let faults = Arc::new(FaultInjector::new(config.faults.clone()));
//! let coordinators = cluster(5, &faults);
//! run_session(&config, &coordinators, &faults).await?;
//! ```

#![warn(clippy::pedantic)]

pub mod coordinator;
pub mod core;
pub mod faults;
pub mod keeper;
pub mod session;

pub use coordinator::{Coordinator, GetError, REGISTER_KEY, SetError};
pub use self::core::{Record, WriteStatus, determine_write_status, smallest_majority};
pub use faults::{FaultConfig, FaultInjector, NetworkError};
pub use keeper::{Keeper, KeeperError, LEASE_TTL};
pub use session::{SessionConfig, SessionError, cluster, run_session};
