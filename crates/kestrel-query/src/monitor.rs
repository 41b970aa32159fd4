//! [`ActiveMonitors`]: live matching of newly committed events.
//!
//! Every installed filter is registered under each value of its primary
//! field (the same field the historical scan would use), or in a catch-all
//! set when it has none. Dispatching an event only visits the buckets the
//! event can hit, then runs the full predicate on each candidate.
//!
//! Buckets hold [`FilterHandle`]s into an arena rather than references into
//! the owning subscription, so subscriptions can move freely.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kestrel_core::{
  ConnId, Event, Id32, PrimaryField, Recipient, SubId, Subscription, keys,
};

use crate::{Error, Result};

/// Stable identity of one installed filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterHandle(u64);

#[derive(Debug)]
struct Installed {
  conn:         ConnId,
  sub_id:       SubId,
  filter_index: usize,
  /// Highest seq this filter has been evaluated against.
  latest_seq:   u64,
}

#[derive(Debug)]
struct Monitor {
  sub:     Subscription,
  handles: Vec<FilterHandle>,
}

type Bucket = BTreeSet<FilterHandle>;

#[derive(Debug)]
enum BucketKey {
  Id(Id32),
  Author(Id32),
  Tag(Vec<u8>),
  Kind(u64),
  Other,
}

#[derive(Debug)]
pub struct ActiveMonitors {
  max_subs_per_connection: usize,
  conns:                   HashMap<ConnId, BTreeMap<SubId, Monitor>>,
  arena:                   HashMap<FilterHandle, Installed>,
  next_handle:             u64,

  by_id:     HashMap<Id32, Bucket>,
  by_author: HashMap<Id32, Bucket>,
  /// Keyed by tag name followed by the tag value.
  by_tag:    HashMap<Vec<u8>, Bucket>,
  by_kind:   HashMap<u64, Bucket>,
  others:    Bucket,
}

impl ActiveMonitors {
  pub fn new(max_subs_per_connection: usize) -> Self {
    Self {
      max_subs_per_connection,
      conns: HashMap::new(),
      arena: HashMap::new(),
      next_handle: 0,
      by_id: HashMap::new(),
      by_author: HashMap::new(),
      by_tag: HashMap::new(),
      by_kind: HashMap::new(),
      others: Bucket::new(),
    }
  }

  /// Start live matching for `sub`, replacing any monitor with the same
  /// `(conn, sub_id)`. Only events with seq above `sub.latest_seq` will be
  /// dispatched to it.
  ///
  /// When the connection is already at its limit nothing is installed.
  pub fn install(&mut self, sub: Subscription) -> Result<()> {
    self.remove_sub(sub.conn, &sub.sub_id);

    let max = self.max_subs_per_connection;
    if self.conn_subs(sub.conn) >= max {
      return Err(Error::TooManySubscriptions { conn: sub.conn, max });
    }

    let mut handles = Vec::with_capacity(sub.filters.len());
    for (filter_index, filter) in sub.filters.filters().iter().enumerate() {
      let handle = FilterHandle(self.next_handle);
      self.next_handle += 1;
      handles.push(handle);

      self.arena.insert(handle, Installed {
        conn: sub.conn,
        sub_id: sub.sub_id.clone(),
        filter_index,
        latest_seq: sub.latest_seq,
      });
      for key in bucket_keys(filter.primary_field()) {
        self.bucket_mut(key).insert(handle);
      }
    }

    tracing::debug!(
      conn = %sub.conn,
      sub = %sub.sub_id,
      latest_seq = sub.latest_seq,
      filters = handles.len(),
      "monitor installed"
    );

    self
      .conns
      .entry(sub.conn)
      .or_default()
      .insert(sub.sub_id.clone(), Monitor { sub, handles });
    Ok(())
  }

  pub fn remove_sub(&mut self, conn: ConnId, sub_id: &SubId) {
    let Some(subs) = self.conns.get_mut(&conn) else {
      return;
    };
    let Some(monitor) = subs.remove(sub_id) else {
      return;
    };
    if subs.is_empty() {
      self.conns.remove(&conn);
    }
    self.uninstall(monitor);
  }

  pub fn close_conn(&mut self, conn: ConnId) {
    let Some(subs) = self.conns.remove(&conn) else {
      return;
    };
    for monitor in subs.into_values() {
      self.uninstall(monitor);
    }
  }

  /// Number of monitors installed for `conn`.
  pub fn conn_subs(&self, conn: ConnId) -> usize {
    self.conns.get(&conn).map_or(0, BTreeMap::len)
  }

  pub fn contains(&self, conn: ConnId, sub_id: &SubId) -> bool {
    self.conns.get(&conn).is_some_and(|s| s.contains_key(sub_id))
  }

  /// True when nothing is installed and every bucket has been pruned.
  pub fn is_empty(&self) -> bool {
    self.conns.is_empty()
      && self.arena.is_empty()
      && self.by_id.is_empty()
      && self.by_author.is_empty()
      && self.by_tag.is_empty()
      && self.by_kind.is_empty()
      && self.others.is_empty()
  }

  /// Match one newly committed event. Must be called in increasing seq
  /// order.
  ///
  /// Returns one recipient per subscription whose filter group matches,
  /// however many of its filters did.
  pub fn dispatch(&mut self, seq: u64, ev: &Event) -> Vec<Recipient> {
    let mut out = Vec::new();
    let arena = &mut self.arena;
    let conns = &mut self.conns;
    let mut visit = |bucket: Option<&Bucket>| {
      if let Some(bucket) = bucket {
        visit_bucket(bucket, arena, conns, seq, ev, &mut out);
      }
    };

    visit(self.by_id.get(&ev.id));
    visit(self.by_author.get(&ev.author));
    for tag in &ev.tags {
      visit(self.by_tag.get(&keys::tag_prefix(tag.name, &tag.value)));
    }
    visit(self.by_kind.get(&ev.kind));
    visit(Some(&self.others));

    out
  }

  fn uninstall(&mut self, monitor: Monitor) {
    let filters = monitor.sub.filters.filters();
    for (filter, handle) in filters.iter().zip(&monitor.handles) {
      self.arena.remove(handle);
      for key in bucket_keys(filter.primary_field()) {
        self.prune(key, handle);
      }
    }
  }

  fn bucket_mut(&mut self, key: BucketKey) -> &mut Bucket {
    match key {
      BucketKey::Id(id) => self.by_id.entry(id).or_default(),
      BucketKey::Author(a) => self.by_author.entry(a).or_default(),
      BucketKey::Tag(t) => self.by_tag.entry(t).or_default(),
      BucketKey::Kind(k) => self.by_kind.entry(k).or_default(),
      BucketKey::Other => &mut self.others,
    }
  }

  fn prune(&mut self, key: BucketKey, handle: &FilterHandle) {
    fn remove<K: std::hash::Hash + Eq>(
      map: &mut HashMap<K, Bucket>,
      key: K,
      handle: &FilterHandle,
    ) {
      if let Some(bucket) = map.get_mut(&key) {
        bucket.remove(handle);
        if bucket.is_empty() {
          map.remove(&key);
        }
      }
    }

    match key {
      BucketKey::Id(id) => remove(&mut self.by_id, id, handle),
      BucketKey::Author(a) => remove(&mut self.by_author, a, handle),
      BucketKey::Tag(t) => remove(&mut self.by_tag, t, handle),
      BucketKey::Kind(k) => remove(&mut self.by_kind, k, handle),
      BucketKey::Other => {
        self.others.remove(handle);
      }
    }
  }
}

fn bucket_keys(field: PrimaryField<'_>) -> Vec<BucketKey> {
  match field {
    PrimaryField::Ids(ids) => ids.iter().map(|id| BucketKey::Id(*id)).collect(),
    PrimaryField::Tag(name, values) => values
      .iter()
      .map(|v| BucketKey::Tag(keys::tag_prefix(name, v)))
      .collect(),
    PrimaryField::Authors(authors) => {
      authors.iter().map(|a| BucketKey::Author(*a)).collect()
    }
    PrimaryField::Kinds(kinds) => kinds.iter().map(|k| BucketKey::Kind(*k)).collect(),
    PrimaryField::None => vec![BucketKey::Other],
  }
}

fn visit_bucket(
  bucket: &Bucket,
  arena: &mut HashMap<FilterHandle, Installed>,
  conns: &mut HashMap<ConnId, BTreeMap<SubId, Monitor>>,
  seq: u64,
  ev: &Event,
  out: &mut Vec<Recipient>,
) {
  for handle in bucket {
    let Some(item) = arena.get_mut(handle) else {
      continue;
    };
    let Some(monitor) = conns
      .get_mut(&item.conn)
      .and_then(|subs| subs.get_mut(&item.sub_id))
    else {
      continue;
    };

    if item.latest_seq >= seq || monitor.sub.latest_seq >= seq {
      continue;
    }
    item.latest_seq = seq;

    let filter = &monitor.sub.filters.filters()[item.filter_index];
    if filter.matches(ev) {
      out.push(monitor.sub.recipient());
      monitor.sub.latest_seq = seq;
    }
  }
}

#[cfg(test)]
mod tests {
  use kestrel_core::Tag;
  use serde_json::json;

  use super::*;
  use crate::tests::{event, group, hex32, id, subscription};

  fn live(conn: u64, sub_id: &str, filters: serde_json::Value) -> Subscription {
    let mut sub = subscription(conn, sub_id, group(filters));
    sub.latest_seq = 0;
    sub
  }

  fn recipients(m: &mut ActiveMonitors, seq: u64, ev: &Event) -> Vec<(u64, String)> {
    let mut out: Vec<_> = m
      .dispatch(seq, ev)
      .into_iter()
      .map(|r| (r.conn.0, r.sub_id.to_string()))
      .collect();
    out.sort();
    out
  }

  #[test]
  fn one_recipient_per_subscription_however_many_filters_match() {
    let mut m = ActiveMonitors::new(20);
    m.install(live(1, "a", json!([
      { "ids": [hex32(0xAA)] },
      { "authors": [hex32(0xBB)] },
      { "kinds": [1] },
      {}
    ])))
    .unwrap();
    m.install(live(2, "b", json!({ "kinds": [1] }))).unwrap();
    m.install(live(3, "c", json!({ "kinds": [2] }))).unwrap();

    let ev = event(0xAA, 0xBB, 100, 1, vec![]);
    assert_eq!(recipients(&mut m, 1, &ev), vec![
      (1, "a".to_owned()),
      (2, "b".to_owned()),
    ]);
  }

  #[test]
  fn bucket_membership_is_not_sufficient() {
    let mut m = ActiveMonitors::new(20);
    m.install(live(1, "a", json!({ "authors": [hex32(0xBB)], "kinds": [7] })))
      .unwrap();

    assert!(m.dispatch(1, &event(1, 0xBB, 100, 1, vec![])).is_empty());
    assert_eq!(m.dispatch(2, &event(2, 0xBB, 100, 7, vec![])).len(), 1);
  }

  #[test]
  fn tag_filters_are_indexed_by_tag() {
    let mut m = ActiveMonitors::new(20);
    m.install(live(1, "a", json!({ "#t": ["rust"], "authors": [hex32(1)] })))
      .unwrap();
    assert!(m.by_author.is_empty());
    assert_eq!(m.by_tag.len(), 1);

    let hit = event(1, 1, 100, 1, vec![Tag::new(b't', "rust")]);
    let miss = event(2, 1, 100, 1, vec![Tag::new(b't', "go")]);
    assert_eq!(m.dispatch(1, &hit).len(), 1);
    assert!(m.dispatch(2, &miss).is_empty());
  }

  #[test]
  fn events_at_or_below_the_watermark_are_ignored() {
    let mut m = ActiveMonitors::new(20);
    let mut sub = live(1, "a", json!({}));
    sub.latest_seq = 10;
    m.install(sub).unwrap();

    assert!(m.dispatch(10, &event(1, 1, 100, 1, vec![])).is_empty());
    assert_eq!(m.dispatch(11, &event(2, 1, 100, 1, vec![])).len(), 1);
    // Redispatching the same seq is a no-op.
    assert!(m.dispatch(11, &event(2, 1, 100, 1, vec![])).is_empty());
  }

  #[test]
  fn repeated_tag_values_hit_a_filter_once() {
    let mut m = ActiveMonitors::new(20);
    m.install(live(1, "a", json!({ "#t": ["x", "y"] }))).unwrap();
    let ev = event(1, 1, 100, 1, vec![Tag::new(b't', "x"), Tag::new(b't', "y")]);
    assert_eq!(m.dispatch(1, &ev).len(), 1);
  }

  #[test]
  fn removal_prunes_every_bucket() {
    let mut m = ActiveMonitors::new(20);
    m.install(live(1, "a", json!([
      { "ids": [hex32(1), hex32(2)] },
      { "#e": [hex32(3)] },
      { "kinds": [1, 2, 3] },
      { "since": 5 }
    ])))
    .unwrap();
    m.install(live(1, "b", json!({ "authors": [hex32(9)] }))).unwrap();
    m.install(live(2, "a", json!({ "kinds": [1] }))).unwrap();

    m.remove_sub(ConnId(1), &SubId::new("a").unwrap());
    assert!(m.by_id.is_empty());
    assert!(m.others.is_empty());
    assert_eq!(m.by_kind.len(), 1);

    m.close_conn(ConnId(1));
    m.close_conn(ConnId(2));
    assert!(m.is_empty());
  }

  #[test]
  fn install_replaces_and_enforces_the_limit() {
    let mut m = ActiveMonitors::new(2);
    m.install(live(1, "a", json!({ "kinds": [1] }))).unwrap();
    m.install(live(1, "a", json!({ "kinds": [2] }))).unwrap();
    assert_eq!(m.conn_subs(ConnId(1)), 1);
    assert!(m.dispatch(1, &event(1, 1, 100, 1, vec![])).is_empty());

    m.install(live(1, "b", json!({}))).unwrap();
    let err = m.install(live(1, "c", json!({ "ids": [hex32(7)] }))).unwrap_err();
    assert!(matches!(err, Error::TooManySubscriptions { max: 2, .. }));
    assert!(!m.contains(ConnId(1), &SubId::new("c").unwrap()));
    assert!(!m.by_id.contains_key(&id(7)));
  }
}
