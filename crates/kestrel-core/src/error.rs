//! Error types for `kestrel-core`.

use thiserror::Error;

/// Why a filter object was rejected. Raised before any subscription exists,
/// so no partial state is ever left behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
  #[error("unsupported filter field: {0:?}")]
  UnsupportedField(String),

  #[error("unindexed tag filter: {0:?}")]
  UnindexedTag(String),

  #[error("too many tag filters (max {max})")]
  TooManyTagFilters { max: usize },

  #[error("filter item has wrong size: expected {expected} bytes, got {got}")]
  BadIdSize { expected: usize, got: usize },

  #[error("tag filter value too large: {0} bytes")]
  BadTagValueSize(usize),

  #[error("filter field {0:?} must be an array")]
  NotAnArray(String),

  #[error("filter field {0:?} must be an unsigned integer")]
  NotAnUnsigned(String),

  #[error("filter array items must be strings")]
  NotAString,

  #[error("filter must be a JSON object")]
  NotAnObject,

  #[error("invalid hex: {0}")]
  Hex(#[from] hex::FromHexError),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("bad filter: {0}")]
  Filter(#[from] FilterError),

  #[error("invalid subscription id: {0}")]
  InvalidSubId(&'static str),

  #[error("invalid event: {0}")]
  InvalidEvent(String),

  #[error("invalid hex: {0}")]
  Hex(#[from] hex::FromHexError),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
