//! Read-side storage traits.
//!
//! The query engine never writes. It opens a short-lived [`Snapshot`] per
//! batch of work through a per-worker [`ReadHandle`], walks the secondary
//! indices backwards, and resolves seqs to events. Backends (the in-memory
//! [`MemoryStore`](crate::MemoryStore), `kestrel-store-sqlite`) implement
//! these traits.

use crate::{event::Event, keys::IndexKind};

/// A consistent, read-only view of the store.
pub trait Snapshot {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Highest seq ever committed, or 0 for an empty store. Never decreases,
  /// even when the newest event is deleted.
  fn latest_seq(&self) -> Result<u64, Self::Error>;

  /// Walk `index` backwards over entries `<= (key, seq)`, in descending
  /// `(key, seq)` order. `visit` returns `false` to stop early.
  ///
  /// Returns `true` if the walk ran off the start of the index.
  fn scan_back(
    &self,
    index: IndexKind,
    key: &[u8],
    seq: u64,
    visit: &mut dyn FnMut(&[u8], u64) -> bool,
  ) -> Result<bool, Self::Error>;

  /// Resolve a seq. `None` if it was deleted, never existed, or its stored
  /// record cannot be decoded.
  fn event(&self, seq: u64) -> Result<Option<Event>, Self::Error>;

  /// Visit every event with seq `> after`, in ascending seq order, until
  /// `visit` returns `false`. Records that cannot be decoded are skipped.
  fn events_after(
    &self,
    after: u64,
    visit: &mut dyn FnMut(u64, &Event) -> bool,
  ) -> Result<(), Self::Error>;
}

/// A per-worker read connection that can open snapshots.
pub trait ReadHandle: Send {
  type Error: std::error::Error + Send + Sync + 'static;
  type Snapshot<'a>: Snapshot<Error = Self::Error>
  where
    Self: 'a;

  fn snapshot(&mut self) -> Result<Self::Snapshot<'_>, Self::Error>;
}

/// A shareable store from which each worker obtains its own read handle.
pub trait EventStore: Clone + Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;
  type Handle: ReadHandle<Error = Self::Error> + 'static;

  fn read_handle(&self) -> Result<Self::Handle, Self::Error>;
}
