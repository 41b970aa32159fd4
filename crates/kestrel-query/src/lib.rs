//! Filter matching and subscription dispatch for the kestrel relay.
//!
//! A subscription is first serviced by a [`DbQuery`], which replays stored
//! events newest first through one resumable [`DbScan`] per filter. When
//! the replay completes the subscription moves to [`ActiveMonitors`], which
//! matches each newly committed event against every installed filter.
//! [`WorkerPool`] shards subscriptions across threads by connection and runs
//! both phases with a round-robin time-slice scheduler.

pub mod config;
pub mod error;
pub mod monitor;
pub mod query;
pub mod scan;
pub mod scheduler;
pub mod worker;

pub use config::QueryConfig;
pub use error::{Error, Result};
pub use monitor::ActiveMonitors;
pub use query::DbQuery;
pub use scan::{Candidate, DbScan, ScanCursor, ScanState};
pub use scheduler::ActiveQueries;
pub use worker::{Delivery, Worker, WorkerMsg, WorkerPool};

#[cfg(test)]
mod tests;
