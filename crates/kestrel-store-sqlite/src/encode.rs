//! Encoding and decoding helpers between kestrel types and SQLite columns.
//!
//! SQLite integers are signed; `u64` fields are stored by bit pattern and
//! restored with the inverse cast. Tags are packed into one blob.

use kestrel_core::{Event, Id32, Tag};

use crate::{Error, Result};

// ─── Integers ────────────────────────────────────────────────────────────────

pub fn encode_u64(v: u64) -> i64 { v as i64 }

pub fn decode_u64(v: i64) -> u64 { v as u64 }

/// A seq used as a range bound. Stored seqs never exceed `i64::MAX`, so
/// larger bounds saturate instead of wrapping negative.
pub fn seq_bound(seq: u64) -> i64 { seq.min(i64::MAX as u64) as i64 }

// ─── Tags ────────────────────────────────────────────────────────────────────

pub fn pack_tags(tags: &[Tag]) -> Result<Vec<u8>> {
  let mut out = Vec::with_capacity(tags.iter().map(|t| 2 + t.value.len()).sum());
  for tag in tags {
    let len = u8::try_from(tag.value.len()).map_err(|_| {
      kestrel_core::Error::InvalidEvent(format!(
        "tag value size out of range: {}",
        tag.value.len()
      ))
    })?;
    out.push(tag.name);
    out.push(len);
    out.extend_from_slice(&tag.value);
  }
  Ok(out)
}

pub fn unpack_tags(seq: u64, mut packed: &[u8]) -> Result<Vec<Tag>> {
  let mut tags = Vec::new();
  while let [name, len, rest @ ..] = packed {
    let len = *len as usize;
    if rest.len() < len {
      return Err(Error::Corrupt { seq, reason: "truncated tag value" });
    }
    tags.push(Tag::new(*name, &rest[..len]));
    packed = &rest[len..];
  }
  if !packed.is_empty() {
    return Err(Error::Corrupt { seq, reason: "trailing tag bytes" });
  }
  Ok(tags)
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Columns read directly from an `events` row.
pub struct RawEvent {
  pub seq:        i64,
  pub id:         Vec<u8>,
  pub author:     Vec<u8>,
  pub created_at: i64,
  pub kind:       i64,
  pub expiration: Option<i64>,
  pub tags:       Vec<u8>,
}

/// Column list matching [`RawEvent::from_row`].
pub const EVENT_COLUMNS: &str = "seq, id, author, created_at, kind, expiration, tags";

impl RawEvent {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:        row.get(0)?,
      id:         row.get(1)?,
      author:     row.get(2)?,
      created_at: row.get(3)?,
      kind:       row.get(4)?,
      expiration: row.get(5)?,
      tags:       row.get(6)?,
    })
  }

  /// Read and decode one row. A column holding the wrong SQLite type counts
  /// as corruption of that row.
  pub fn decode(row: &rusqlite::Row<'_>) -> Result<(u64, Event)> {
    match Self::from_row(row) {
      Ok(raw) => raw.into_event(),
      Err(
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..),
      ) => {
        let seq = row.get::<_, i64>(0).map_or(0, decode_u64);
        Err(Error::Corrupt { seq, reason: "column has the wrong type" })
      }
      Err(e) => Err(e.into()),
    }
  }

  pub fn into_event(self) -> Result<(u64, Event)> {
    let seq = decode_u64(self.seq);
    let id = Id32::from_slice(&self.id)
      .ok_or(Error::Corrupt { seq, reason: "id is not 32 bytes" })?;
    let author = Id32::from_slice(&self.author)
      .ok_or(Error::Corrupt { seq, reason: "author is not 32 bytes" })?;

    let event = Event {
      id,
      author,
      created_at: decode_u64(self.created_at),
      kind: decode_u64(self.kind),
      expiration: self.expiration.map(decode_u64),
      tags: unpack_tags(seq, &self.tags)?,
    };
    Ok((seq, event))
  }
}
