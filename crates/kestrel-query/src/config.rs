//! Engine tuning knobs, deserialised from the `relay` section of the
//! binary's configuration.

use std::time::Duration;

use kestrel_core::filter::DEFAULT_MAX_FILTER_LIMIT;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// Upper bound applied to every filter's `limit`.
  pub max_filter_limit:          u64,
  pub max_subs_per_connection:   usize,
  /// Wall-clock budget for one scheduling slice of a query.
  pub query_timeslice_budget_us: u64,
  pub num_workers:               usize,
  /// `authors × kinds` cross-product size below which a filter is scanned
  /// through the by-(author,kind) index.
  pub author_kind_cap:           u64,
  pub logging:                   LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log per-filter scan metrics at `info` instead of `debug`.
  pub db_scan_perf: bool,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      max_filter_limit:          DEFAULT_MAX_FILTER_LIMIT,
      max_subs_per_connection:   20,
      query_timeslice_budget_us: 10_000,
      num_workers:               3,
      author_kind_cap:           1_000,
      logging:                   LoggingConfig::default(),
    }
  }
}

impl QueryConfig {
  pub fn timeslice_budget(&self) -> Duration {
    Duration::from_micros(self.query_timeslice_budget_us)
  }
}
