//! Secondary-index key layouts.
//!
//! Every index key is a field prefix followed by the event's `created_at`
//! as 8 big-endian bytes; the value stored under the key is the event seq.
//! Entries are ordered by `(key, seq)`, so walking an index backwards from
//! `prefix ++ until` yields one field value's events newest first, ties
//! broken by descending seq.
//!
//! ```text
//! by-id:          id(32)                  ++ created_at(8)
//! by-author:      author(32)              ++ created_at(8)
//! by-kind:        kind(8)                 ++ created_at(8)
//! by-author-kind: author(32) ++ kind(8)   ++ created_at(8)
//! by-tag:         name(1) ++ value(≤255)  ++ created_at(8)
//! by-created-at:                             created_at(8)
//! ```

use strum::{Display, EnumIter, IntoStaticStr};

use crate::event::{Event, Id32};

/// One of the six secondary indices.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter,
  IntoStaticStr,
)]
pub enum IndexKind {
  Id,
  Author,
  Kind,
  AuthorKind,
  Tag,
  CreatedAt,
}

pub fn id_prefix(id: &Id32) -> Vec<u8> { id.0.to_vec() }

pub fn author_prefix(author: &Id32) -> Vec<u8> { author.0.to_vec() }

pub fn kind_prefix(kind: u64) -> Vec<u8> { kind.to_be_bytes().to_vec() }

pub fn author_kind_prefix(author: &Id32, kind: u64) -> Vec<u8> {
  let mut p = Vec::with_capacity(40);
  p.extend_from_slice(&author.0);
  p.extend_from_slice(&kind.to_be_bytes());
  p
}

pub fn tag_prefix(name: u8, value: &[u8]) -> Vec<u8> {
  let mut p = Vec::with_capacity(1 + value.len());
  p.push(name);
  p.extend_from_slice(value);
  p
}

/// Append `created_at` to a field prefix.
pub fn index_key(prefix: &[u8], created_at: u64) -> Vec<u8> {
  let mut k = Vec::with_capacity(prefix.len() + 8);
  k.extend_from_slice(prefix);
  k.extend_from_slice(&created_at.to_be_bytes());
  k
}

/// The trailing `created_at` of an index key, or `None` if the key is too
/// short to carry one.
pub fn key_created_at(key: &[u8]) -> Option<u64> {
  let tail = key.len().checked_sub(8).map(|start| &key[start..])?;
  Some(u64::from_be_bytes(tail.try_into().ok()?))
}

/// All index entries an event contributes, as `(index, key)` pairs. The
/// stored value for each is the event's seq.
pub fn index_entries(ev: &Event) -> Vec<(IndexKind, Vec<u8>)> {
  let at = ev.created_at;
  let mut out = vec![
    (IndexKind::Id, index_key(&id_prefix(&ev.id), at)),
    (IndexKind::Author, index_key(&author_prefix(&ev.author), at)),
    (IndexKind::Kind, index_key(&kind_prefix(ev.kind), at)),
    (
      IndexKind::AuthorKind,
      index_key(&author_kind_prefix(&ev.author, ev.kind), at),
    ),
    (IndexKind::CreatedAt, index_key(&[], at)),
  ];
  for tag in &ev.tags {
    out.push((IndexKind::Tag, index_key(&tag_prefix(tag.name, &tag.value), at)));
  }
  out
}
