//! Error type for `kestrel-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] kestrel_core::Error),

  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("database error: {0}")]
  Async(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// A stored row could not be decoded.
  #[error("corrupt record at seq {seq}: {reason}")]
  Corrupt { seq: u64, reason: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
