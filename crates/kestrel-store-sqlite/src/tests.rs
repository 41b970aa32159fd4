//! Integration tests for `SqliteStore` against a throwaway database file.

use std::{path::PathBuf, time::Duration};

use kestrel_core::{
  ConnId, Event, EventStore, FilterGroup, Id32, IndexKind, ReadHandle, Recipient,
  Snapshot, SubId, Subscription, Tag, keys,
};
use kestrel_query::{DbQuery, Delivery, QueryConfig, Worker, WorkerMsg};
use serde_json::json;
use uuid::Uuid;

use crate::{Error, SqliteStore};

/// Removes the database and its WAL files when dropped.
struct TempDb(PathBuf);

impl Drop for TempDb {
  fn drop(&mut self) {
    for suffix in ["", "-wal", "-shm"] {
      let mut p = self.0.clone().into_os_string();
      p.push(suffix);
      let _ = std::fs::remove_file(p);
    }
  }
}

async fn store() -> (SqliteStore, TempDb) {
  let path = std::env::temp_dir().join(format!("kestrel-{}.db", Uuid::new_v4()));
  let s = SqliteStore::open(&path).await.expect("temp store");
  (s, TempDb(path))
}

/// Overwrite a stored row's packed tags with bytes that cannot be unpacked.
fn corrupt_tags(db: &TempDb, seq: u64) {
  let conn = rusqlite::Connection::open(&db.0).unwrap();
  conn.busy_timeout(Duration::from_secs(5)).unwrap();
  let n = conn
    .execute("UPDATE events SET tags = x'74' WHERE seq = ?1", [seq as i64])
    .unwrap();
  assert_eq!(n, 1);
}

fn event(id: u8, created_at: u64, kind: u64, tags: Vec<Tag>) -> Event {
  Event {
    id: Id32([id; 32]),
    author: Id32([0xAA; 32]),
    created_at,
    kind,
    expiration: None,
    tags,
  }
}

// ─── Writes ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_assigns_increasing_seqs() {
  let (s, _db) = store().await;
  let a = s.insert(&event(1, 10, 1, vec![])).await.unwrap();
  let b = s.insert(&event(2, 5, 1, vec![])).await.unwrap();
  assert_eq!(a, Some(1));
  assert_eq!(b, Some(2));
  assert_eq!(s.latest_seq().await.unwrap(), 2);
}

#[tokio::test]
async fn duplicate_id_is_ignored() {
  let (s, _db) = store().await;
  s.insert(&event(1, 10, 1, vec![])).await.unwrap();
  assert_eq!(s.insert(&event(1, 99, 2, vec![])).await.unwrap(), None);
  assert_eq!(s.latest_seq().await.unwrap(), 1);
}

#[tokio::test]
async fn insert_json_keeps_the_original_text() {
  let (s, _db) = store().await;
  let raw = json!({
    "id": hex::encode([3u8; 32]),
    "pubkey": hex::encode([4u8; 32]),
    "created_at": 1_700_000_000u64,
    "kind": 1,
    "tags": [["t", "rust"], ["expiration", "1800000000"]],
    "content": "hello",
    "sig": "00",
  })
  .to_string();
  let seq = s.insert_json(&raw).await.unwrap().unwrap();

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  assert_eq!(snap.event_json(seq).unwrap().as_deref(), Some(raw.as_str()));

  let ev = snap.event(seq).unwrap().unwrap();
  assert_eq!(ev.expiration, Some(1_800_000_000));
  assert_eq!(ev.tags, vec![Tag::new(b't', "rust")]);
}

#[tokio::test]
async fn malformed_json_is_rejected() {
  let (s, _db) = store().await;
  assert!(matches!(s.insert_json("{").await, Err(Error::Json(_))));
  assert!(matches!(s.insert_json("{}").await, Err(Error::Core(_))));
}

#[tokio::test]
async fn deleted_seq_is_gone_but_not_reused() {
  let (s, _db) = store().await;
  let a = s.insert(&event(1, 10, 1, vec![])).await.unwrap().unwrap();
  assert!(s.delete(a).await.unwrap());
  assert!(!s.delete(a).await.unwrap());
  let b = s.insert(&event(2, 10, 1, vec![])).await.unwrap().unwrap();
  assert_eq!(b, a + 1);

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  assert!(snap.event(a).unwrap().is_none());
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scan_back_is_descending_and_bounded() {
  let (s, _db) = store().await;
  let tag = || vec![Tag::new(b'e', [7u8; 32])];
  let s1 = s.insert(&event(1, 100, 1, tag())).await.unwrap().unwrap();
  let s2 = s.insert(&event(2, 300, 1, tag())).await.unwrap().unwrap();
  let s3 = s.insert(&event(3, 200, 1, tag())).await.unwrap().unwrap();
  s.insert(&event(4, 999, 1, vec![Tag::new(b'e', [8u8; 32])])).await.unwrap();

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  let prefix = keys::tag_prefix(b'e', &[7u8; 32]);
  let start = keys::index_key(&prefix, u64::MAX);

  let mut seen = Vec::new();
  snap
    .scan_back(IndexKind::Tag, &start, u64::MAX, &mut |k, seq| {
      if !k.starts_with(&prefix) {
        return false;
      }
      seen.push(seq);
      true
    })
    .unwrap();
  assert_eq!(seen, vec![s2, s3, s1]);

  // Resuming from an exact (key, seq) includes that entry.
  let mut resumed = Vec::new();
  let at = keys::index_key(&prefix, 200);
  snap
    .scan_back(IndexKind::Tag, &at, s3, &mut |_, seq| {
      resumed.push(seq);
      resumed.len() < 2
    })
    .unwrap();
  assert_eq!(resumed, vec![s3, s1]);
}

#[tokio::test]
async fn snapshot_does_not_see_later_commits() {
  let (s, _db) = store().await;
  s.insert(&event(1, 10, 1, vec![])).await.unwrap();

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  assert_eq!(snap.latest_seq().unwrap(), 1);

  s.insert(&event(2, 20, 1, vec![])).await.unwrap();
  assert_eq!(snap.latest_seq().unwrap(), 1);
  let mut after = Vec::new();
  snap
    .events_after(0, &mut |seq, _| {
      after.push(seq);
      true
    })
    .unwrap();
  assert_eq!(after, vec![1]);
  drop(snap);

  assert_eq!(reader.snapshot().unwrap().latest_seq().unwrap(), 2);
}

#[tokio::test]
async fn query_runs_against_sqlite() {
  let (s, _db) = store().await;
  let mut seqs = Vec::new();
  for (i, t) in [100u64, 500, 300, 200, 400].into_iter().enumerate() {
    seqs.push(s.insert(&event(i as u8, t, 1, vec![])).await.unwrap().unwrap());
  }
  s.insert(&event(9, 600, 2, vec![])).await.unwrap();

  let group = FilterGroup::from_json(
    &json!({ "kinds": [1], "authors": [hex::encode([0xAAu8; 32])], "limit": 2 }),
    500,
  )
  .unwrap();
  let mut sub = Subscription::new(ConnId(1), SubId::new("q").unwrap(), group);

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  sub.latest_seq = snap.latest_seq().unwrap();
  let mut q = DbQuery::new(sub, 1_000, false);
  let mut out = Vec::new();
  assert!(q.process(&snap, Duration::MAX, |_, seq| out.push(seq)).unwrap());
  assert_eq!(out, vec![seqs[1], seqs[4]]);
}

// ─── Corrupt rows ────────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_row_does_not_stall_live_dispatch() {
  let (s, db) = store().await;
  let sub_id = SubId::new("s").unwrap();
  let group = FilterGroup::from_json(&json!({ "kinds": [1] }), 500).unwrap();

  let mut w = Worker::new(s.read_handle().unwrap(), QueryConfig::default());
  let mut out = Vec::new();
  w.step(vec![WorkerMsg::NewSub(Subscription::new(ConnId(1), sub_id.clone(), group))], |d| {
    out.push(d)
  })
  .unwrap();
  assert!(w.monitors().contains(ConnId(1), &sub_id));

  let bad = s.insert(&event(1, 10, 1, vec![])).await.unwrap().unwrap();
  let good = s.insert(&event(2, 20, 1, vec![])).await.unwrap().unwrap();
  corrupt_tags(&db, bad);

  // Twice: the second pass must not revisit the bad row or redeliver.
  for expected in [vec![good], vec![]] {
    let mut out = Vec::new();
    w.step(vec![WorkerMsg::DbChange], |d| out.push(d)).unwrap();
    let live: Vec<Delivery> = expected
      .into_iter()
      .map(|seq| Delivery::Live {
        recipients: vec![Recipient { conn: ConnId(1), sub_id: sub_id.clone() }],
        seq,
      })
      .collect();
    assert_eq!(out, live);
  }

  let later = s.insert(&event(3, 30, 1, vec![])).await.unwrap().unwrap();
  let mut out = Vec::new();
  w.step(vec![WorkerMsg::DbChange], |d| out.push(d)).unwrap();
  assert!(matches!(out.as_slice(), [Delivery::Live { seq, .. }] if *seq == later));
}

#[tokio::test]
async fn corrupt_row_reads_as_missing_during_a_scan() {
  let (s, db) = store().await;
  let tag = || vec![Tag::new(b't', "x")];
  let bad = s.insert(&event(1, 30, 1, tag())).await.unwrap().unwrap();
  let good = s.insert(&event(2, 20, 1, tag())).await.unwrap().unwrap();
  corrupt_tags(&db, bad);

  let mut reader = s.read_handle().unwrap();
  let snap = reader.snapshot().unwrap();
  assert!(snap.event(bad).unwrap().is_none());

  // Two major fields, so every candidate is fetched in full.
  let group = FilterGroup::from_json(&json!({ "kinds": [1], "#t": ["x"] }), 500).unwrap();
  let mut sub = Subscription::new(ConnId(1), SubId::new("q").unwrap(), group);
  sub.latest_seq = snap.latest_seq().unwrap();
  let mut q = DbQuery::new(sub, 1_000, false);
  let mut found = Vec::new();
  assert!(q.process(&snap, Duration::MAX, |_, seq| found.push(seq)).unwrap());
  assert_eq!(found, vec![good]);
}
