//! [`ActiveQueries`]: round-robin time slicing of a worker's queries.

use std::collections::{HashMap, VecDeque};

use kestrel_core::{ConnId, Snapshot, SubId, Subscription};

use crate::{DbQuery, Error, QueryConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueryId(u64);

/// The queries owned by one worker.
///
/// Removal only marks a query dead; it is dropped when it next reaches the
/// front of the ready queue, so an in-flight slice never outlives its
/// subscription's registration.
#[derive(Debug)]
pub struct ActiveQueries {
  config:  QueryConfig,
  conns:   HashMap<ConnId, HashMap<SubId, QueryId>>,
  queries: HashMap<QueryId, DbQuery>,
  running: VecDeque<QueryId>,
  next_id: u64,
}

impl ActiveQueries {
  pub fn new(config: QueryConfig) -> Self {
    Self {
      config,
      conns: HashMap::new(),
      queries: HashMap::new(),
      running: VecDeque::new(),
      next_id: 0,
    }
  }

  /// Register `sub` for historical replay, replacing any query with the
  /// same `(conn, sub_id)`. `latest_seq` is the newest seq visible to the
  /// snapshot the replay starts from; later seqs are left to the monitor.
  ///
  /// `live` is the number of subscriptions the connection already holds
  /// outside this scheduler. When the connection is at its limit nothing is
  /// registered.
  pub fn add_sub(
    &mut self,
    mut sub: Subscription,
    latest_seq: u64,
    live: usize,
  ) -> Result<()> {
    sub.latest_seq = latest_seq;
    self.remove_sub(sub.conn, &sub.sub_id);

    let max = self.config.max_subs_per_connection;
    let held = self.conns.get(&sub.conn).map_or(0, HashMap::len);
    if held + live >= max {
      return Err(Error::TooManySubscriptions { conn: sub.conn, max });
    }

    let id = QueryId(self.next_id);
    self.next_id += 1;

    tracing::debug!(
      conn = %sub.conn,
      sub = %sub.sub_id,
      latest_seq = sub.latest_seq,
      filters = sub.filters.len(),
      "query scheduled"
    );

    self
      .conns
      .entry(sub.conn)
      .or_default()
      .insert(sub.sub_id.clone(), id);
    let query = DbQuery::new(
      sub,
      self.config.author_kind_cap,
      self.config.logging.db_scan_perf,
    );
    self.queries.insert(id, query);
    self.running.push_front(id);
    Ok(())
  }

  pub fn remove_sub(&mut self, conn: ConnId, sub_id: &SubId) {
    let Some(subs) = self.conns.get_mut(&conn) else {
      return;
    };
    if let Some(q) = subs.remove(sub_id).and_then(|id| self.queries.get_mut(&id)) {
      q.dead = true;
    }
    if subs.is_empty() {
      self.conns.remove(&conn);
    }
  }

  pub fn close_conn(&mut self, conn: ConnId) {
    let Some(subs) = self.conns.remove(&conn) else {
      return;
    };
    for id in subs.into_values() {
      if let Some(q) = self.queries.get_mut(&id) {
        q.dead = true;
      }
    }
  }

  /// Number of queries registered for `conn`.
  pub fn conn_subs(&self, conn: ConnId) -> usize {
    self.conns.get(&conn).map_or(0, HashMap::len)
  }

  pub fn contains(&self, conn: ConnId, sub_id: &SubId) -> bool {
    self.conns.get(&conn).is_some_and(|s| s.contains_key(sub_id))
  }

  /// No query is waiting for a slice.
  pub fn is_idle(&self) -> bool { self.running.is_empty() }

  /// Run one slice of the query at the head of the ready queue.
  ///
  /// Returns the subscription once its replay is complete; it has then been
  /// unregistered here and is ready for the live monitor.
  pub fn process<S: Snapshot>(
    &mut self,
    snap: &S,
    on_event: impl FnMut(&Subscription, u64),
  ) -> Result<Option<Subscription>> {
    let Some(id) = self.running.pop_front() else {
      return Ok(None);
    };
    let Some(query) = self.queries.get_mut(&id) else {
      return Ok(None);
    };
    if query.is_dead() {
      self.queries.remove(&id);
      return Ok(None);
    }

    let complete = match query.process(snap, self.config.timeslice_budget(), on_event) {
      Ok(complete) => complete,
      Err(e) => {
        self.running.push_back(id);
        return Err(Error::store(e));
      }
    };

    if !complete {
      self.running.push_back(id);
      return Ok(None);
    }

    let Some(query) = self.queries.remove(&id) else {
      return Ok(None);
    };
    let sub = query.sub;
    self.remove_sub(sub.conn, &sub.sub_id);
    Ok(Some(sub))
  }
}
