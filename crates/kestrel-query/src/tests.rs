//! Shared fixtures and cross-module properties: scan soundness, determinism
//! and resumability against a fuzzed corpus, and the scan to monitor
//! handoff.

use std::time::Duration;

use kestrel_core::{
  ConnId, EventStore, Event, Filter, FilterGroup, Id32, MemoryStore, Recipient,
  Snapshot, SubId, Subscription, Tag,
};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

use crate::{DbQuery, DbScan, Delivery, QueryConfig, Worker, WorkerMsg};

// ─── Fixtures ────────────────────────────────────────────────────────────────

pub(crate) fn hex32(b: u8) -> String { hex::encode([b; 32]) }

pub(crate) fn id(b: u8) -> Id32 { Id32([b; 32]) }

pub(crate) fn event(
  id_byte: u8,
  author_byte: u8,
  created_at: u64,
  kind: u64,
  tags: Vec<Tag>,
) -> Event {
  Event {
    id: id(id_byte),
    author: id(author_byte),
    created_at,
    kind,
    expiration: None,
    tags,
  }
}

pub(crate) fn filter(v: Value) -> Filter { Filter::from_json(&v, u64::MAX).unwrap() }

pub(crate) fn group(v: Value) -> FilterGroup {
  FilterGroup::from_json(&v, u64::MAX).unwrap()
}

pub(crate) fn subscription(conn: u64, sub_id: &str, filters: FilterGroup) -> Subscription {
  Subscription::new(ConnId(conn), SubId::new(sub_id).unwrap(), filters)
}

/// Run one scan to completion without pausing. May repeat a seq when the
/// event carries several of the filter's values.
pub(crate) fn run_scan(store: &MemoryStore, f: &Filter) -> Vec<u64> {
  let mut scan = DbScan::new(f, 1_000);
  let mut out = Vec::new();
  let done = scan
    .scan(&store.snapshot(), |seq| {
      out.push(seq);
      false
    }, |_| false)
    .unwrap();
  assert!(done);
  out
}

fn query_all(store: &MemoryStore, g: FilterGroup, author_kind_cap: u64) -> Vec<u64> {
  let snap = store.snapshot();
  let mut sub = subscription(1, "q", g);
  sub.latest_seq = snap.latest_seq().unwrap();

  let mut q = DbQuery::new(sub, author_kind_cap, false);
  let mut out = Vec::new();
  assert!(q.process(&snap, Duration::MAX, |_, seq| out.push(seq)).unwrap());
  out
}

/// Every seq a group's historical replay delivers, in delivery order.
pub(crate) fn run_query(store: &MemoryStore, g: FilterGroup) -> Vec<u64> {
  query_all(store, g, 1_000)
}

/// What a single filter should return: every match, newest first, ties
/// broken by descending seq, cut at `limit`.
fn expected(store: &MemoryStore, f: &Filter) -> Vec<u64> {
  let snap = store.snapshot();
  let mut hits = Vec::new();
  snap
    .events_after(0, &mut |seq, ev| {
      if f.matches(ev) {
        hits.push((ev.created_at, seq));
      }
      true
    })
    .unwrap();
  hits.sort_by(|a, b| b.cmp(a));
  hits.into_iter().take(f.limit() as usize).map(|(_, seq)| seq).collect()
}

// ─── Strategies ──────────────────────────────────────────────────────────────

const T_VALUES: [&str; 3] = ["a", "b", "c"];

fn arb_tag() -> impl Strategy<Value = Tag> {
  prop_oneof![
    (0u8..3).prop_map(|v| Tag::new(b'e', [v; 32])),
    prop::sample::select(T_VALUES.to_vec()).prop_map(|v| Tag::new(b't', v)),
  ]
}

prop_compose! {
  fn arb_event()(
    id_byte in 0u8..40,
    author in 0u8..4,
    created_at in 0u64..60,
    kind in 0u64..4,
    tags in prop::collection::vec(arb_tag(), 0..3),
  ) -> Event {
    event(id_byte, author, created_at, kind, tags)
  }
}

fn arb_set<T: std::fmt::Debug + Clone>(
  s: impl Strategy<Value = T>,
) -> impl Strategy<Value = Option<Vec<T>>> {
  prop::option::of(prop::collection::vec(s, 1..4))
}

prop_compose! {
  fn arb_filter_json()(
    ids in arb_set(0u8..40),
    authors in arb_set(0u8..4),
    kinds in arb_set(0u64..4),
    t in arb_set(prop::sample::select(T_VALUES.to_vec())),
    e in arb_set(0u8..3),
    since in prop::option::of(0u64..60),
    until in prop::option::of(0u64..60),
    limit in prop::option::of(1u64..20),
  ) -> Value {
    let mut m = Map::new();
    let hexes = |v: Vec<u8>| json!(v.into_iter().map(hex32).collect::<Vec<_>>());
    if let Some(v) = ids { m.insert("ids".into(), hexes(v)); }
    if let Some(v) = authors { m.insert("authors".into(), hexes(v)); }
    if let Some(v) = kinds { m.insert("kinds".into(), json!(v)); }
    if let Some(v) = t { m.insert("#t".into(), json!(v)); }
    if let Some(v) = e { m.insert("#e".into(), hexes(v)); }
    if let Some(v) = since { m.insert("since".into(), json!(v)); }
    if let Some(v) = until { m.insert("until".into(), json!(v)); }
    if let Some(v) = limit { m.insert("limit".into(), json!(v)); }
    Value::Object(m)
  }
}

fn store_of(events: Vec<Event>) -> MemoryStore {
  let store = MemoryStore::new();
  for ev in events {
    store.insert(ev);
  }
  store
}

// ─── Properties ──────────────────────────────────────────────────────────────

proptest! {
  #[test]
  fn scan_emits_exactly_the_matching_events(
    events in prop::collection::vec(arb_event(), 0..120),
    f in arb_filter_json(),
    cap in 1u64..12,
  ) {
    let store = store_of(events);
    let f = filter(f);
    let got = query_all(&store, FilterGroup::from_filters(vec![f.clone()]), cap);
    prop_assert_eq!(got, expected(&store, &f));
  }

  #[test]
  fn scanning_twice_gives_the_same_sequence(
    events in prop::collection::vec(arb_event(), 0..120),
    f in arb_filter_json(),
  ) {
    let store = store_of(events);
    let f = filter(f);
    prop_assert_eq!(run_scan(&store, &f), run_scan(&store, &f));
  }

  #[test]
  fn pausing_anywhere_does_not_change_the_result(
    events in prop::collection::vec(arb_event(), 0..120),
    f in arb_filter_json(),
    slice in 0u64..40,
  ) {
    let store = store_of(events);
    let f = filter(f);
    let straight = run_scan(&store, &f);

    let mut scan = DbScan::new(&f, 1_000);
    let mut out = Vec::new();
    let mut slices = 0;
    loop {
      let start = scan.work();
      let snap = store.snapshot();
      let done = scan
        .scan(&snap, |seq| { out.push(seq); false }, |w| w > start + slice + 1)
        .unwrap();
      if done {
        break;
      }
      slices += 1;
    }

    prop_assert_eq!(out, straight);
    prop_assert!(slices as u64 <= scan.work());
  }
}

// ─── Handoff and fan-out ─────────────────────────────────────────────────────

fn seqs_for(deliveries: &[Delivery], conn: ConnId, sub: &str) -> Vec<u64> {
  let me = Recipient { conn, sub_id: SubId::new(sub).unwrap() };
  deliveries
    .iter()
    .filter_map(|d| match d {
      Delivery::Event { conn: c, sub_id, seq } if *c == me.conn && *sub_id == me.sub_id => {
        Some(*seq)
      }
      Delivery::Live { recipients, seq } if recipients.contains(&me) => Some(*seq),
      _ => None,
    })
    .collect()
}

#[test]
fn concurrent_commits_are_delivered_exactly_once() {
  let store = MemoryStore::new();
  let mut matching = Vec::new();
  for i in 0..3_000u64 {
    matching.push(store.insert(event((i % 250) as u8, 1, i, 1, vec![])));
  }

  let config = QueryConfig { query_timeslice_budget_us: 0, ..QueryConfig::default() };
  let mut w = Worker::new(store.read_handle().unwrap(), config);
  let mut out = Vec::new();
  let sub = subscription(1, "s", group(json!({ "kinds": [1] })));
  w.step(vec![WorkerMsg::NewSub(sub)], |d| out.push(d)).unwrap();

  // Interleave commits, monitor passes and scan slices, including commits
  // the monitor has not been told about when the replay completes.
  let mut t = 10_000;
  for round in 0..40 {
    t += 1;
    matching.push(store.insert(event(0xF0, 1, t, 1, vec![])));
    store.insert(event(0xF1, 1, t, 2, vec![]));
    let msgs = if round % 3 == 0 { vec![] } else { vec![WorkerMsg::DbChange] };
    w.step(msgs, |d| out.push(d)).unwrap();
  }
  assert!(w.is_idle());
  w.step(vec![WorkerMsg::DbChange], |d| out.push(d)).unwrap();

  let mut got = seqs_for(&out, ConnId(1), "s");
  got.sort_unstable();
  matching.sort_unstable();
  assert_eq!(got, matching);
}

#[test]
fn dispatch_fans_out_once_per_matching_subscription() {
  let store = MemoryStore::new();
  let mut w = Worker::new(store.read_handle().unwrap(), QueryConfig::default());

  let subs = [
    (1, "ids-or-author", json!([{ "ids": [hex32(0xA)] }, { "authors": [hex32(0xB)] }])),
    (1, "kind", json!({ "kinds": [1] })),
    (2, "everything", json!([{}, { "kinds": [1] }, { "#t": ["x"] }])),
    (3, "tag", json!({ "#t": ["x", "y"] })),
    (3, "miss", json!({ "kinds": [2] })),
  ];
  let msgs = subs
    .iter()
    .map(|(conn, name, g)| WorkerMsg::NewSub(subscription(*conn, name, group(g.clone()))))
    .collect::<Vec<_>>();
  w.step(msgs, |_| {}).unwrap();
  while !w.is_idle() {
    w.step(vec![], |_| {}).unwrap();
  }

  let seq = store.insert(event(0xA, 0xB, 100, 1, vec![Tag::new(b't', "x"), Tag::new(b't', "y")]));
  let mut out = Vec::new();
  w.step(vec![WorkerMsg::DbChange], |d| out.push(d)).unwrap();

  let [Delivery::Live { recipients, seq: got }] = out.as_slice() else {
    panic!("expected one live delivery, got {out:?}");
  };
  assert_eq!(*got, seq);
  let mut names: Vec<&str> = recipients.iter().map(|r| r.sub_id.as_str()).collect();
  names.sort_unstable();
  assert_eq!(names, vec!["everything", "ids-or-author", "kind", "tag"]);
}
