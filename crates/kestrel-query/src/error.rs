//! Error type for `kestrel-query`.

use kestrel_core::ConnId;
use thiserror::Error;

/// Conditions the engine cannot absorb. Deleted events and exhausted time
/// budgets are not errors: the former are skipped, the latter pause the
/// scan for a later resume.
#[derive(Debug, Error)]
pub enum Error {
  /// The connection already holds its maximum number of subscriptions.
  /// Nothing was registered.
  #[error("too many concurrent REQs on connection {conn} (max {max})")]
  TooManySubscriptions { conn: ConnId, max: usize },

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("failed to spawn worker thread")]
  Spawn(#[from] std::io::Error),
}

impl Error {
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
