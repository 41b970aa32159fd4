//! Subscriptions: a connection's registered interest in a filter group.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, FilterGroup, Result};

/// Longest accepted subscription id, in bytes.
pub const MAX_SUB_ID_LEN: usize = 39;

/// Opaque identity of a client connection. Workers shard on it.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// Client-chosen subscription name, unique per connection.
///
/// 1 to 39 bytes of printable ASCII, excluding `"` and `\`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubId(String);

impl SubId {
  pub fn new(s: impl Into<String>) -> Result<Self> {
    let s = s.into();
    if s.is_empty() {
      return Err(Error::InvalidSubId("subscription id too short"));
    }
    if s.len() > MAX_SUB_ID_LEN {
      return Err(Error::InvalidSubId("subscription id too long"));
    }
    if s.bytes().any(|c| c < 0x20 || c >= 0x7f || c == b'\\' || c == b'"') {
      return Err(Error::InvalidSubId("invalid character in subscription id"));
    }
    Ok(Self(s))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SubId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl<'de> Deserialize<'de> for SubId {
  fn deserialize<D: serde::Deserializer<'de>>(
    d: D,
  ) -> std::result::Result<Self, D::Error> {
    SubId::new(String::deserialize(d)?).map_err(serde::de::Error::custom)
  }
}

/// Where a matched event should be sent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recipient {
  pub conn:   ConnId,
  pub sub_id: SubId,
}

/// The unit of client interest.
///
/// `latest_seq` is the watermark separating historical replay from live
/// delivery: a scan only emits seqs `<= latest_seq`, the live monitor only
/// seqs `> latest_seq`. It is unset (`u64::MAX`) until the subscription is
/// scheduled against a snapshot.
#[derive(Debug, Clone)]
pub struct Subscription {
  pub conn:       ConnId,
  pub sub_id:     SubId,
  pub filters:    FilterGroup,
  pub latest_seq: u64,
}

impl Subscription {
  pub fn new(conn: ConnId, sub_id: SubId, filters: FilterGroup) -> Self {
    Self { conn, sub_id, filters, latest_seq: u64::MAX }
  }

  pub fn recipient(&self) -> Recipient {
    Recipient { conn: self.conn, sub_id: self.sub_id.clone() }
  }
}
