//! [`DbQuery`]: historical replay of a whole filter group.
//!
//! Filters run strictly in order, one [`DbScan`] at a time. Seqs newer than
//! the subscription's watermark are skipped: the live monitor delivers
//! those after the handoff.

use std::{
  collections::HashSet,
  time::{Duration, Instant},
};

use kestrel_core::{Snapshot, Subscription};

use crate::scan::DbScan;

/// Work units between wall-clock checks.
const WORK_PER_CLOCK_CHECK: u64 = 2_000;

#[derive(Debug, Default)]
struct ScanMetrics {
  curr_time:          Duration,
  curr_save_restores: u64,
  total_time:         Duration,
  total_work:         u64,
}

#[derive(Debug)]
pub struct DbQuery {
  pub sub:           Subscription,
  scan:              Option<DbScan>,
  filter_index:      usize,
  /// Set when the subscription is removed; the scheduler drops the query
  /// at its next turn.
  pub(crate) dead:   bool,
  /// Every seq sent over the subscription's lifetime.
  sent_full:         HashSet<u64>,
  /// Seqs matched by the current filter; enforces its `limit`.
  sent_curr:         HashSet<u64>,
  last_work_checked: u64,
  author_kind_cap:   u64,
  log_perf:          bool,
  metrics:           ScanMetrics,
}

impl DbQuery {
  /// `sub.latest_seq` must already hold the snapshot watermark.
  pub fn new(sub: Subscription, author_kind_cap: u64, log_perf: bool) -> Self {
    Self {
      sub,
      scan: None,
      filter_index: 0,
      dead: false,
      sent_full: HashSet::new(),
      sent_curr: HashSet::new(),
      last_work_checked: 0,
      author_kind_cap,
      log_perf,
      metrics: ScanMetrics::default(),
    }
  }

  pub fn is_dead(&self) -> bool { self.dead }

  /// Number of distinct seqs delivered so far.
  pub fn sent(&self) -> usize { self.sent_full.len() }

  /// Advance the query for at most roughly `budget` of wall-clock time,
  /// calling `on_event` once per newly matched seq.
  ///
  /// Returns `true` once every filter is exhausted. Callers re-invoke
  /// until then, each time with a fresh snapshot.
  pub fn process<S: Snapshot>(
    &mut self,
    snap: &S,
    budget: Duration,
    mut on_event: impl FnMut(&Subscription, u64),
  ) -> Result<bool, S::Error> {
    while self.filter_index < self.sub.filters.len() {
      let filter = &self.sub.filters.filters()[self.filter_index];
      let limit = filter.limit();
      let latest_seq = self.sub.latest_seq;

      let start = Instant::now();
      let complete = if limit == 0 {
        true
      } else {
        let cap = self.author_kind_cap;
        let scan = self.scan.get_or_insert_with(|| DbScan::new(filter, cap));
        let sent_full = &mut self.sent_full;
        let sent_curr = &mut self.sent_curr;
        let last_work_checked = &mut self.last_work_checked;
        let sub = &self.sub;

        scan.scan(
          snap,
          |seq| {
            if seq > latest_seq {
              return false;
            }
            if sent_full.insert(seq) {
              on_event(sub, seq);
            }
            sent_curr.insert(seq);
            sent_curr.len() as u64 >= limit
          },
          |work| {
            if work > *last_work_checked + WORK_PER_CLOCK_CHECK {
              *last_work_checked = work;
              return start.elapsed() > budget;
            }
            false
          },
        )?
      };
      self.metrics.curr_time += start.elapsed();

      if !complete {
        self.metrics.curr_save_restores += 1;
        return Ok(false);
      }

      self.finish_filter();
    }

    self.log_group_metrics();
    Ok(true)
  }

  fn finish_filter(&mut self) {
    let work = self.scan.as_ref().map_or(0, DbScan::work);
    self.metrics.total_time += self.metrics.curr_time;
    self.metrics.total_work += work;

    if let Some(scan) = &self.scan {
      let index: &'static str = scan.index().into();
      let time_us = self.metrics.curr_time.as_micros() as u64;
      macro_rules! report {
        ($lvl:ident) => {
          tracing::$lvl!(
            conn = %self.sub.conn,
            sub = %self.sub.sub_id,
            filter = self.filter_index,
            scan = index,
            index_only = scan.index_only(),
            time_us,
            save_restores = self.metrics.curr_save_restores,
            recs_found = self.sent_curr.len(),
            work,
            "filter scan complete"
          )
        };
      }
      if self.log_perf { report!(info) } else { report!(debug) }
    }

    self.scan = None;
    self.filter_index += 1;
    self.sent_curr.clear();
    self.last_work_checked = 0;
    self.metrics.curr_time = Duration::ZERO;
    self.metrics.curr_save_restores = 0;
  }

  fn log_group_metrics(&self) {
    let total_time_us = self.metrics.total_time.as_micros() as u64;
    macro_rules! report {
      ($lvl:ident) => {
        tracing::$lvl!(
          conn = %self.sub.conn,
          sub = %self.sub.sub_id,
          total_time_us,
          total_work = self.metrics.total_work,
          recs_sent = self.sent_full.len(),
          "query complete"
        )
      };
    }
    if self.log_perf { report!(info) } else { report!(debug) }
  }
}
