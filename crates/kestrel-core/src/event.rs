//! The indexable summary of a stored event.
//!
//! Only the fields that participate in filter matching are modelled here.
//! Signature checks, payload compression and the canonical JSON form are the
//! ingestion pipeline's concern.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::{Error, Result};

/// Largest tag value that can appear in the by-tag index.
pub const MAX_TAG_VALUE_SIZE: usize = 255;

// ─── Id32 ────────────────────────────────────────────────────────────────────

/// A 32-byte identifier: event ids, author keys and `e`/`p` tag values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id32(pub [u8; 32]);

impl Id32 {
  pub fn from_slice(bytes: &[u8]) -> Option<Self> {
    <[u8; 32]>::try_from(bytes).ok().map(Self)
  }

  pub fn as_bytes(&self) -> &[u8; 32] { &self.0 }
}

impl fmt::Display for Id32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&hex::encode(self.0))
  }
}

impl fmt::Debug for Id32 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Id32({self})")
  }
}

impl FromStr for Id32 {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let bytes = hex::decode(s)?;
    Self::from_slice(&bytes).ok_or_else(|| {
      Error::InvalidEvent(format!("expected 32 bytes of hex, got {}", bytes.len()))
    })
  }
}

impl Serialize for Id32 {
  fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Id32 {
  fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

// ─── Tag ─────────────────────────────────────────────────────────────────────

/// A single-character tag as it is indexed: `e` and `p` values hold the
/// decoded 32 bytes, every other value holds the raw string bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
  pub name:  u8,
  pub value: Vec<u8>,
}

impl Tag {
  pub fn new(name: u8, value: impl Into<Vec<u8>>) -> Self {
    Self { name, value: value.into() }
  }

  /// Tags whose values are hex-encoded 32-byte ids on the wire.
  pub fn is_hex_valued(name: u8) -> bool { name == b'e' || name == b'p' }
}

// ─── Event ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  pub id:         Id32,
  pub author:     Id32,
  pub created_at: u64,
  pub kind:       u64,
  pub expiration: Option<u64>,
  pub tags:       Vec<Tag>,
}

impl Event {
  /// Parse the relay wire shape. Keys other than `id`, `pubkey`,
  /// `created_at`, `kind` and `tags` are ignored.
  pub fn from_json(v: &Value) -> Result<Self> {
    let obj = v
      .as_object()
      .ok_or_else(|| Error::InvalidEvent("event must be an object".into()))?;

    let id = str_field(obj, "id")?.parse()?;
    let author = str_field(obj, "pubkey")?.parse()?;
    let created_at = u64_field(obj, "created_at")?;
    let kind = u64_field(obj, "kind")?;

    let mut tags = Vec::new();
    let mut expiration = None;

    let raw_tags = obj
      .get("tags")
      .and_then(Value::as_array)
      .ok_or_else(|| Error::InvalidEvent("missing tags array".into()))?;

    for raw in raw_tags {
      let items = raw
        .as_array()
        .ok_or_else(|| Error::InvalidEvent("tag must be an array".into()))?;
      if items.len() < 2 {
        return Err(Error::InvalidEvent("too few fields in tag".into()));
      }
      let (Some(name), Some(value)) = (items[0].as_str(), items[1].as_str())
      else {
        return Err(Error::InvalidEvent("tag fields must be strings".into()));
      };

      if name == "expiration" {
        expiration = value.parse().ok();
        continue;
      }

      // Only single-character tags are indexed.
      let &[name] = name.as_bytes() else { continue };

      let value = if Tag::is_hex_valued(name) {
        value.parse::<Id32>()?.0.to_vec()
      } else {
        value.as_bytes().to_vec()
      };

      if value.is_empty() || value.len() > MAX_TAG_VALUE_SIZE {
        return Err(Error::InvalidEvent(format!(
          "tag value size out of range: {}",
          value.len()
        )));
      }

      tags.push(Tag { name, value });
    }

    Ok(Self { id, author, created_at, kind, expiration, tags })
  }

  /// Render the indexed fields back into the wire shape.
  pub fn to_json(&self) -> Value {
    let tags: Vec<Value> = self
      .tags
      .iter()
      .map(|t| {
        let value = if Tag::is_hex_valued(t.name) {
          hex::encode(&t.value)
        } else {
          String::from_utf8_lossy(&t.value).into_owned()
        };
        json!([(t.name as char).to_string(), value])
      })
      .collect();

    let mut v = json!({
      "id":         self.id.to_string(),
      "pubkey":     self.author.to_string(),
      "created_at": self.created_at,
      "kind":       self.kind,
      "tags":       tags,
    });

    if let Some(exp) = self.expiration {
      if let Some(arr) = v["tags"].as_array_mut() {
        arr.push(json!(["expiration", exp.to_string()]));
      }
    }
    v
  }

  /// Values of every tag named `name`.
  pub fn tag_values(&self, name: u8) -> impl Iterator<Item = &[u8]> {
    self
      .tags
      .iter()
      .filter(move |t| t.name == name)
      .map(|t| t.value.as_slice())
  }
}

fn str_field<'a>(
  obj: &'a serde_json::Map<String, Value>,
  key: &str,
) -> Result<&'a str> {
  obj
    .get(key)
    .and_then(Value::as_str)
    .ok_or_else(|| Error::InvalidEvent(format!("missing string field {key:?}")))
}

fn u64_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<u64> {
  obj
    .get(key)
    .and_then(Value::as_u64)
    .ok_or_else(|| Error::InvalidEvent(format!("missing unsigned field {key:?}")))
}
