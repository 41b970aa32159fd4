//! Filters and filter groups, the declarative match predicates of a
//! subscription.
//!
//! A [`Filter`] ANDs its fields together; each set-valued field matches if
//! the event's value is any member of the set. A [`FilterGroup`] ORs its
//! filters.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
  FilterError,
  event::{Event, Id32, MAX_TAG_VALUE_SIZE, Tag},
};

/// Maximum number of distinct `#x` keys in one filter. Tag matching is a
/// scan over the event's tags per key, so this bounds per-event cost.
pub const MAX_TAG_FILTERS: usize = 3;

/// Every non-tag key a filter object may carry.
const FIELDS: [&str; 6] = ["ids", "authors", "kinds", "since", "until", "limit"];

/// Limit clamp used when the caller has no configured value.
pub const DEFAULT_MAX_FILTER_LIMIT: u64 = 500;

// ─── FilterSet ───────────────────────────────────────────────────────────────

/// A sorted, de-duplicated set of filter values with O(log n) membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet<T>(Vec<T>);

impl<T: Ord> FilterSet<T> {
  pub fn new(mut items: Vec<T>) -> Self {
    items.sort();
    items.dedup();
    Self(items)
  }

  pub fn contains(&self, item: &T) -> bool { self.0.binary_search(item).is_ok() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn iter(&self) -> std::slice::Iter<'_, T> { self.0.iter() }
}

impl FilterSet<Vec<u8>> {
  fn contains_bytes(&self, item: &[u8]) -> bool {
    self.0.binary_search_by(|v| v.as_slice().cmp(item)).is_ok()
  }
}

// ─── PrimaryField ────────────────────────────────────────────────────────────

/// The single field a filter is indexed by, chosen by a fixed priority:
/// ids, then the tag key with the fewest values, then authors, then kinds.
/// Both the historical scan and the live monitor use this choice.
#[derive(Debug, Clone, Copy)]
pub enum PrimaryField<'a> {
  Ids(&'a FilterSet<Id32>),
  Tag(u8, &'a FilterSet<Vec<u8>>),
  Authors(&'a FilterSet<Id32>),
  Kinds(&'a FilterSet<u64>),
  None,
}

// ─── Filter ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
  ids:         Option<FilterSet<Id32>>,
  authors:     Option<FilterSet<Id32>>,
  kinds:       Option<FilterSet<u64>>,
  tags:        BTreeMap<u8, FilterSet<Vec<u8>>>,
  since:       u64,
  until:       u64,
  limit:       u64,
  never_match: bool,
  index_only:  bool,
}

impl Filter {
  /// Build a filter from its JSON object form, clamping `limit` to
  /// `max_limit`.
  ///
  /// A known field given as an empty array makes the filter match nothing
  /// rather than failing. Unknown keys are rejected whatever their value.
  pub fn from_json(v: &Value, max_limit: u64) -> Result<Self, FilterError> {
    let obj = v.as_object().ok_or(FilterError::NotAnObject)?;

    let mut f = Filter {
      ids:         None,
      authors:     None,
      kinds:       None,
      tags:        BTreeMap::new(),
      since:       0,
      until:       u64::MAX,
      limit:       u64::MAX,
      never_match: false,
      index_only:  false,
    };
    // Each `#x` key counts on its own.
    let mut major_fields = 0usize;

    for (k, v) in obj {
      match k.strip_prefix('#') {
        Some(name) if name.len() != 1 => {
          return Err(FilterError::UnindexedTag(k.clone()));
        }
        Some(_) => {}
        None if !FIELDS.contains(&k.as_str()) => {
          return Err(FilterError::UnsupportedField(k.clone()));
        }
        None => {}
      }
      if v.as_array().is_some_and(Vec::is_empty) {
        f.never_match = true;
        continue;
      }

      match k.as_str() {
        "ids" => {
          f.ids = Some(FilterSet::new(parse_ids(k, v)?));
          major_fields += 1;
        }
        "authors" => {
          f.authors = Some(FilterSet::new(parse_ids(k, v)?));
          major_fields += 1;
        }
        "kinds" => {
          let items = as_array(k, v)?
            .iter()
            .map(|i| i.as_u64().ok_or_else(|| FilterError::NotAnUnsigned(k.clone())))
            .collect::<Result<Vec<_>, _>>()?;
          f.kinds = Some(FilterSet::new(items));
          major_fields += 1;
        }
        "since" => f.since = as_u64(k, v)?,
        "until" => f.until = as_u64(k, v)?,
        "limit" => f.limit = as_u64(k, v)?,
        tag if tag.starts_with('#') => {
          let &[_, name] = tag.as_bytes() else {
            return Err(FilterError::UnindexedTag(tag.to_owned()));
          };
          f.tags.insert(name, FilterSet::new(parse_tag_values(name, k, v)?));
          major_fields += 1;
        }
        other => return Err(FilterError::UnsupportedField(other.to_owned())),
      }
    }

    if f.tags.len() > MAX_TAG_FILTERS {
      return Err(FilterError::TooManyTagFilters { max: MAX_TAG_FILTERS });
    }

    f.limit = f.limit.min(max_limit);
    f.index_only = major_fields <= 1
      || (major_fields == 2 && f.authors.is_some() && f.kinds.is_some());

    Ok(f)
  }

  pub fn ids(&self) -> Option<&FilterSet<Id32>> { self.ids.as_ref() }

  pub fn authors(&self) -> Option<&FilterSet<Id32>> { self.authors.as_ref() }

  pub fn kinds(&self) -> Option<&FilterSet<u64>> { self.kinds.as_ref() }

  pub fn tags(&self) -> &BTreeMap<u8, FilterSet<Vec<u8>>> { &self.tags }

  pub fn since(&self) -> u64 { self.since }

  pub fn until(&self) -> u64 { self.until }

  pub fn limit(&self) -> u64 { self.limit }

  pub fn never_match(&self) -> bool { self.never_match }

  /// True when membership in the primary index (plus the time range) alone
  /// decides a match, so scans can skip fetching the full event.
  pub fn index_only(&self) -> bool { self.index_only }

  pub fn primary_field(&self) -> PrimaryField<'_> {
    if let Some(ids) = &self.ids {
      return PrimaryField::Ids(ids);
    }
    // min_by_key keeps the first minimum, so ties go to the lowest tag name.
    if let Some((name, set)) = self.tags.iter().min_by_key(|(_, set)| set.len()) {
      return PrimaryField::Tag(*name, set);
    }
    if let Some(authors) = &self.authors {
      return PrimaryField::Authors(authors);
    }
    if let Some(kinds) = &self.kinds {
      return PrimaryField::Kinds(kinds);
    }
    PrimaryField::None
  }

  pub fn matches_times(&self, created_at: u64) -> bool {
    created_at >= self.since && created_at <= self.until
  }

  pub fn matches(&self, ev: &Event) -> bool {
    if self.never_match || !self.matches_times(ev.created_at) {
      return false;
    }
    if self.ids.as_ref().is_some_and(|s| !s.contains(&ev.id)) {
      return false;
    }
    if self.authors.as_ref().is_some_and(|s| !s.contains(&ev.author)) {
      return false;
    }
    if self.kinds.as_ref().is_some_and(|s| !s.contains(&ev.kind)) {
      return false;
    }
    self
      .tags
      .iter()
      .all(|(name, set)| ev.tag_values(*name).any(|v| set.contains_bytes(v)))
  }

  /// No major field and no limit: the filter asks for the whole store.
  pub fn is_full_scan(&self) -> bool {
    self.ids.is_none()
      && self.authors.is_none()
      && self.kinds.is_none()
      && self.tags.is_empty()
      && self.limit == u64::MAX
  }
}

fn as_array<'a>(k: &str, v: &'a Value) -> Result<&'a Vec<Value>, FilterError> {
  v.as_array().ok_or_else(|| FilterError::NotAnArray(k.to_owned()))
}

fn as_u64(k: &str, v: &Value) -> Result<u64, FilterError> {
  v.as_u64().ok_or_else(|| FilterError::NotAnUnsigned(k.to_owned()))
}

fn parse_ids(k: &str, v: &Value) -> Result<Vec<Id32>, FilterError> {
  as_array(k, v)?
    .iter()
    .map(|i| {
      let bytes = hex::decode(i.as_str().ok_or(FilterError::NotAString)?)?;
      Id32::from_slice(&bytes).ok_or(FilterError::BadIdSize {
        expected: 32,
        got:      bytes.len(),
      })
    })
    .collect()
}

fn parse_tag_values(
  name: u8,
  k: &str,
  v: &Value,
) -> Result<Vec<Vec<u8>>, FilterError> {
  if Tag::is_hex_valued(name) {
    return Ok(parse_ids(k, v)?.into_iter().map(|id| id.0.to_vec()).collect());
  }
  as_array(k, v)?
    .iter()
    .map(|i| {
      let s = i.as_str().ok_or(FilterError::NotAString)?;
      if s.len() > MAX_TAG_VALUE_SIZE {
        return Err(FilterError::BadTagValueSize(s.len()));
      }
      Ok(s.as_bytes().to_vec())
    })
    .collect()
}

// ─── FilterGroup ─────────────────────────────────────────────────────────────

/// An ordered OR of filters, compiled once per subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterGroup {
  filters: Vec<Filter>,
}

impl FilterGroup {
  /// Accepts a single filter object or an array of them. Filters that can
  /// never match are dropped.
  pub fn from_json(v: &Value, max_limit: u64) -> Result<Self, FilterError> {
    let filters = match v {
      Value::Array(items) => items
        .iter()
        .map(|i| Filter::from_json(i, max_limit))
        .collect::<Result<Vec<_>, _>>()?,
      other => vec![Filter::from_json(other, max_limit)?],
    };
    Ok(Self::from_filters(filters))
  }

  pub fn from_filters(filters: Vec<Filter>) -> Self {
    Self {
      filters: filters.into_iter().filter(|f| !f.never_match).collect(),
    }
  }

  pub fn filters(&self) -> &[Filter] { &self.filters }

  pub fn len(&self) -> usize { self.filters.len() }

  pub fn is_empty(&self) -> bool { self.filters.is_empty() }

  pub fn matches(&self, ev: &Event) -> bool {
    self.filters.iter().any(|f| f.matches(ev))
  }

  pub fn is_full_scan(&self) -> bool {
    self.filters.len() == 1 && self.filters[0].is_full_scan()
  }
}
