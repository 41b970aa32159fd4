//! An in-process, copy-on-write event store.
//!
//! Each index is a `BTreeSet` of `(key, seq)` pairs, so backward range walks
//! cost O(log n + k). Snapshots share the current tables through an `Arc`;
//! writers clone-on-write, so an open snapshot never observes later commits.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  convert::Infallible,
  sync::{Arc, PoisonError, RwLock},
};

use crate::{
  event::Event,
  keys::{IndexKind, index_entries},
  store::{EventStore, ReadHandle, Snapshot},
};

#[derive(Debug, Clone, Default)]
struct Tables {
  last_seq: u64,
  events:   BTreeMap<u64, Event>,
  indices:  HashMap<IndexKind, BTreeSet<(Vec<u8>, u64)>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  tables: Arc<RwLock<Arc<Tables>>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  /// Commit an event and all of its index entries. Returns the new seq.
  pub fn insert(&self, event: Event) -> u64 {
    let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);
    let tables = Arc::make_mut(&mut guard);

    tables.last_seq += 1;
    let seq = tables.last_seq;
    for (index, key) in index_entries(&event) {
      tables.indices.entry(index).or_default().insert((key, seq));
    }
    tables.events.insert(seq, event);
    seq
  }

  /// Remove an event and its index entries. The seq is never reused.
  pub fn delete(&self, seq: u64) -> bool {
    let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);
    let tables = Arc::make_mut(&mut guard);

    let Some(event) = tables.events.remove(&seq) else {
      return false;
    };
    for (index, key) in index_entries(&event) {
      if let Some(set) = tables.indices.get_mut(&index) {
        set.remove(&(key, seq));
      }
    }
    true
  }

  /// Open a snapshot directly, without going through a read handle.
  pub fn snapshot(&self) -> MemorySnapshot {
    let guard = self.tables.read().unwrap_or_else(PoisonError::into_inner);
    MemorySnapshot { tables: Arc::clone(&guard) }
  }
}

/// A frozen view of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
  tables: Arc<Tables>,
}

impl Snapshot for MemorySnapshot {
  type Error = Infallible;

  fn latest_seq(&self) -> Result<u64, Infallible> { Ok(self.tables.last_seq) }

  fn scan_back(
    &self,
    index: IndexKind,
    key: &[u8],
    seq: u64,
    visit: &mut dyn FnMut(&[u8], u64) -> bool,
  ) -> Result<bool, Infallible> {
    let Some(set) = self.tables.indices.get(&index) else {
      return Ok(true);
    };
    for (k, s) in set.range(..=(key.to_vec(), seq)).rev() {
      if !visit(k, *s) {
        return Ok(false);
      }
    }
    Ok(true)
  }

  fn event(&self, seq: u64) -> Result<Option<Event>, Infallible> {
    Ok(self.tables.events.get(&seq).cloned())
  }

  fn events_after(
    &self,
    after: u64,
    visit: &mut dyn FnMut(u64, &Event) -> bool,
  ) -> Result<(), Infallible> {
    use std::ops::Bound;

    let range = (Bound::Excluded(after), Bound::Unbounded);
    for (seq, ev) in self.tables.events.range(range) {
      if !visit(*seq, ev) {
        break;
      }
    }
    Ok(())
  }
}

/// Read handle for a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryReader {
  store: MemoryStore,
}

impl ReadHandle for MemoryReader {
  type Error = Infallible;
  type Snapshot<'a> = MemorySnapshot;

  fn snapshot(&mut self) -> Result<MemorySnapshot, Infallible> {
    Ok(self.store.snapshot())
  }
}

impl EventStore for MemoryStore {
  type Error = Infallible;
  type Handle = MemoryReader;

  fn read_handle(&self) -> Result<MemoryReader, Infallible> {
    Ok(MemoryReader { store: self.clone() })
  }
}
