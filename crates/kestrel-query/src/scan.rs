//! Indexed scan of one filter against the store's secondary indices.
//!
//! The filter's primary field picks an index and yields one [`ScanCursor`]
//! per field value. Each cursor walks its slice of the index backwards, so
//! it produces newest-first candidates on its own; a lazy k-way merge over a
//! shared buffer interleaves them without ever materialising a cursor's full
//! result set.
//!
//! All progress lives in [`ScanState`]. A scan can stop at any pause point
//! and continue later against a fresh snapshot.

use std::{cmp::Ordering, collections::VecDeque};

use kestrel_core::{Filter, IndexKind, PrimaryField, Snapshot, keys};

const MIN_INITIAL_BATCH: u64 = 5;
const MAX_INITIAL_BATCH: u64 = 50;
const REFILL_FACTOR: u64 = 10;

/// Work units charged for resolving a seq to its full event. Reading one
/// index entry costs 1.
pub const FETCH_COST: u64 = 10;

// ─── Candidate ───────────────────────────────────────────────────────────────

/// An index hit waiting in the merge buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
  pub seq:        u64,
  pub created_at: u64,
  /// Index of the cursor that produced it.
  pub cursor:     usize,
}

impl Candidate {
  /// Newest first; equal timestamps fall back to descending seq.
  pub fn newer_first(a: &Self, b: &Self) -> Ordering {
    b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq))
  }
}

// ─── ScanCursor ──────────────────────────────────────────────────────────────

/// A backward walk over one field value's slice of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
  prefix:      Vec<u8>,
  /// Where the next batch starts, inclusive. `None` once exhausted.
  resume_key:  Option<Vec<u8>>,
  resume_seq:  u64,
  /// Candidates from this cursor still sitting in the merge buffer.
  outstanding: u64,
}

struct Batch {
  candidates: Vec<Candidate>,
  next:       Option<(Vec<u8>, u64)>,
  visited:    u64,
}

impl ScanCursor {
  /// Start at the last key for `prefix` not newer than `until`.
  pub fn new(prefix: Vec<u8>, until: u64) -> Self {
    let resume_key = Some(keys::index_key(&prefix, until));
    Self { prefix, resume_key, resume_seq: u64::MAX, outstanding: 0 }
  }

  pub fn is_active(&self) -> bool { self.resume_key.is_some() }

  pub fn resume_key(&self) -> Option<&[u8]> { self.resume_key.as_deref() }

  pub fn resume_seq(&self) -> u64 { self.resume_seq }

  pub fn outstanding(&self) -> u64 { self.outstanding }

  /// Whether an index key still belongs to this cursor's field value.
  pub fn owns(&self, key: &[u8]) -> bool {
    key.len() == self.prefix.len() + 8 && key.starts_with(&self.prefix)
  }

  /// Read up to `limit` candidates without touching `self`, so a failed
  /// read leaves the cursor where it was.
  fn collect<S: Snapshot>(
    &self,
    snap: &S,
    index: IndexKind,
    since: u64,
    cursor: usize,
    limit: u64,
  ) -> Result<Batch, S::Error> {
    let mut candidates = Vec::new();
    let mut next = None;
    let mut visited = 0;

    let Some(start) = &self.resume_key else {
      return Ok(Batch { candidates, next, visited });
    };

    snap.scan_back(index, start, self.resume_seq, &mut |k, seq| {
      if candidates.len() as u64 == limit {
        next = Some((k.to_vec(), seq));
        return false;
      }
      visited += 1;
      if !self.owns(k) {
        return false;
      }
      let Some(created_at) = keys::key_created_at(k) else {
        return false;
      };
      // Everything further back is older still.
      if created_at < since {
        return false;
      }
      candidates.push(Candidate { seq, created_at, cursor });
      true
    })?;

    Ok(Batch { candidates, next, visited })
  }

  fn absorb(&mut self, batch: Batch) -> Vec<Candidate> {
    match batch.next {
      Some((key, seq)) => {
        self.resume_key = Some(key);
        self.resume_seq = seq;
      }
      None => self.resume_key = None,
    }
    self.outstanding += batch.candidates.len() as u64;
    batch.candidates
  }
}

// ─── ScanState ───────────────────────────────────────────────────────────────

/// Everything a paused scan needs to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanState {
  pub cursors:   Vec<ScanCursor>,
  /// Sorted newest first.
  pub buffer:    VecDeque<Candidate>,
  /// Cursors before this index have drawn their initial batch.
  pub next_init: usize,
  /// Monotonic work counter fed to the pause predicate.
  pub work:      u64,
}

// ─── DbScan ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DbScan {
  filter:        Filter,
  index:         IndexKind,
  index_only:    bool,
  initial_batch: u64,
  refill_batch:  u64,
  state:         ScanState,
}

impl DbScan {
  /// Plan a scan for `filter`. `authors × kinds` products below
  /// `author_kind_cap` use the by-(author,kind) index.
  pub fn new(filter: &Filter, author_kind_cap: u64) -> Self {
    use IndexKind as I;

    let mut index_only = filter.index_only();

    let (index, prefixes): (IndexKind, Vec<Vec<u8>>) = if filter.never_match() {
      (I::CreatedAt, Vec::new())
    } else {
      match filter.primary_field() {
        PrimaryField::Ids(ids) => (I::Id, ids.iter().map(keys::id_prefix).collect()),
        PrimaryField::Tag(name, values) => (
          I::Tag,
          values.iter().map(|v| keys::tag_prefix(name, v)).collect(),
        ),
        PrimaryField::Authors(authors) => match filter.kinds() {
          Some(kinds)
            if (authors.len() as u64).saturating_mul(kinds.len() as u64)
              < author_kind_cap =>
          {
            let prefixes = authors
              .iter()
              .flat_map(|a| kinds.iter().map(move |k| keys::author_kind_prefix(a, *k)))
              .collect();
            (I::AuthorKind, prefixes)
          }
          kinds => {
            // Kinds must be checked against the full event now.
            if kinds.is_some() {
              index_only = false;
            }
            (I::Author, authors.iter().map(keys::author_prefix).collect())
          }
        },
        PrimaryField::Kinds(kinds) => {
          (I::Kind, kinds.iter().map(|k| keys::kind_prefix(*k)).collect())
        }
        PrimaryField::None => (I::CreatedAt, vec![Vec::new()]),
      }
    };

    let cursors: Vec<ScanCursor> = prefixes
      .into_iter()
      .map(|p| ScanCursor::new(p, filter.until()))
      .collect();

    let initial_batch = (filter.limit() / cursors.len().max(1) as u64)
      .clamp(MIN_INITIAL_BATCH, MAX_INITIAL_BATCH);

    Self {
      filter: filter.clone(),
      index,
      index_only,
      initial_batch,
      refill_batch: REFILL_FACTOR * initial_batch,
      state: ScanState {
        cursors,
        buffer: VecDeque::new(),
        next_init: 0,
        work: 0,
      },
    }
  }

  pub fn filter(&self) -> &Filter { &self.filter }

  pub fn index(&self) -> IndexKind { self.index }

  pub fn index_only(&self) -> bool { self.index_only }

  pub fn state(&self) -> &ScanState { &self.state }

  pub fn work(&self) -> u64 { self.state.work }

  /// Advance the scan.
  ///
  /// `on_match` receives each matching seq, newest first, and returns
  /// `true` to end the scan early. `pause` is polled with the work counter
  /// before every unit of work; when it returns `true` the scan stops
  /// without consuming anything and can be resumed by calling `scan` again.
  ///
  /// Returns `true` once the scan is complete. Seqs that no longer resolve
  /// to an event are skipped.
  pub fn scan<S: Snapshot>(
    &mut self,
    snap: &S,
    mut on_match: impl FnMut(u64) -> bool,
    mut pause: impl FnMut(u64) -> bool,
  ) -> Result<bool, S::Error> {
    let since = self.filter.since();
    let state = &mut self.state;

    loop {
      state.work += 1;
      if pause(state.work) {
        return Ok(false);
      }

      if state.next_init < state.cursors.len() {
        let i = state.next_init;
        let batch =
          state.cursors[i].collect(snap, self.index, since, i, self.initial_batch)?;
        state.work += batch.visited;
        let found = state.cursors[i].absorb(batch);
        state.buffer.extend(found);
        state.next_init += 1;

        if state.next_init == state.cursors.len() {
          state.buffer.make_contiguous().sort_by(Candidate::newer_first);
        }
        continue;
      }

      let Some(&next) = state.buffer.front() else {
        return Ok(true);
      };

      let matched = if self.index_only {
        self.filter.matches_times(next.created_at)
      } else {
        state.work += FETCH_COST;
        snap
          .event(next.seq)?
          .is_some_and(|ev| self.filter.matches(&ev))
      };

      // The cursor runs dry with this pop: read its next batch before
      // mutating anything so a failed read can be retried.
      let cursor = &state.cursors[next.cursor];
      let refill = if cursor.outstanding == 1 && cursor.is_active() {
        Some(cursor.collect(snap, self.index, since, next.cursor, self.refill_batch)?)
      } else {
        None
      };

      state.buffer.pop_front();
      let cursor = &mut state.cursors[next.cursor];
      cursor.outstanding -= 1;

      if let Some(batch) = refill {
        state.work += batch.visited;
        let more = cursor.absorb(batch);
        let buffer = std::mem::take(&mut state.buffer);
        state.buffer = merge_newer_first(buffer, more);
      }

      if matched && on_match(next.seq) {
        return Ok(true);
      }
    }
  }
}

/// Merge two newest-first runs into one.
fn merge_newer_first(a: VecDeque<Candidate>, b: Vec<Candidate>) -> VecDeque<Candidate> {
  let mut out = VecDeque::with_capacity(a.len() + b.len());
  let mut a = a.into_iter().peekable();
  let mut b = b.into_iter().peekable();

  loop {
    let take_a = match (a.peek(), b.peek()) {
      (Some(x), Some(y)) => Candidate::newer_first(x, y) != Ordering::Greater,
      (Some(_), None) => true,
      (None, Some(_)) => false,
      (None, None) => break,
    };
    out.extend(if take_a { a.next() } else { b.next() });
  }
  out
}
