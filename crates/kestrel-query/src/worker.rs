//! Sharded workers: each owns a read handle, a query scheduler and a live
//! monitor, and is the only thread that ever touches its connections.

use std::{collections::VecDeque, thread, time::Duration};

use kestrel_core::{
  ConnId, EventStore, ReadHandle, Recipient, Snapshot, SubId, Subscription,
};
use tokio::sync::mpsc::{
  self, UnboundedReceiver, UnboundedSender, error::TryRecvError,
};

use crate::{ActiveMonitors, ActiveQueries, Error, QueryConfig, Result};

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Notice text sent when a connection is at its subscription limit.
pub const TOO_MANY_REQS: &str = "too many concurrent REQs";

#[derive(Debug)]
pub enum WorkerMsg {
  /// Replay then follow. Filters must already be compiled.
  NewSub(Subscription),
  RemoveSub { conn: ConnId, sub_id: SubId },
  CloseConn(ConnId),
  /// New events have been committed.
  DbChange,
}

impl WorkerMsg {
  /// The connection this message is sharded by. `None` for broadcasts.
  pub fn conn(&self) -> Option<ConnId> {
    match self {
      WorkerMsg::NewSub(sub) => Some(sub.conn),
      WorkerMsg::RemoveSub { conn, .. } | WorkerMsg::CloseConn(conn) => Some(*conn),
      WorkerMsg::DbChange => None,
    }
  }
}

/// Output of a worker, for the connection layer to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
  /// A historical match, newest first within a subscription.
  Event { conn: ConnId, sub_id: SubId, seq: u64 },
  /// Historical replay for the subscription is done.
  Eose { conn: ConnId, sub_id: SubId },
  /// A newly committed event and everyone who should receive it.
  Live { recipients: Vec<Recipient>, seq: u64 },
  Notice { conn: ConnId, message: String },
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// One shard's state, driven by [`Worker::step`].
#[derive(Debug)]
pub struct Worker<H> {
  handle:      H,
  queries:     ActiveQueries,
  monitors:    ActiveMonitors,
  /// Messages not yet handled. A step that cannot open a snapshot leaves
  /// them here for the next one.
  pending:     VecDeque<WorkerMsg>,
  /// Replays that have sent EOSE and still need their gap replayed before
  /// they go live.
  handoffs:    VecDeque<Subscription>,
  /// Every event up to this seq has been dispatched to the monitors.
  current_seq: u64,
}

impl<H: ReadHandle> Worker<H> {
  pub fn new(handle: H, config: QueryConfig) -> Self {
    Self {
      handle,
      monitors: ActiveMonitors::new(config.max_subs_per_connection),
      queries: ActiveQueries::new(config),
      pending: VecDeque::new(),
      handoffs: VecDeque::new(),
      current_seq: u64::MAX,
    }
  }

  /// Nothing is waiting for another step: no query slice, no queued
  /// message and no unfinished handoff.
  pub fn is_idle(&self) -> bool {
    self.queries.is_idle() && self.pending.is_empty() && self.handoffs.is_empty()
  }

  pub fn monitors(&self) -> &ActiveMonitors { &self.monitors }

  pub fn queries(&self) -> &ActiveQueries { &self.queries }

  /// Handle `msgs`, then run one query slice, all against a single fresh
  /// snapshot that is released before returning.
  ///
  /// A store error in one message does not affect the others. A failed
  /// dispatch pass is queued again and resumes where it stopped. The first
  /// error is returned after everything else in the step has run.
  pub fn step(
    &mut self,
    msgs: impl IntoIterator<Item = WorkerMsg>,
    mut out: impl FnMut(Delivery),
  ) -> Result<()> {
    self.pending.extend(msgs);
    let Self { handle, queries, monitors, pending, handoffs, current_seq } = self;

    let snap = handle.snapshot().map_err(Error::store)?;
    let latest = snap.latest_seq().map_err(Error::store)?;
    if *current_seq > latest {
      *current_seq = latest;
    }

    let mut failure = None;
    let mut redispatch = false;

    for msg in std::mem::take(pending) {
      match msg {
        WorkerMsg::NewSub(sub) => {
          let conn = sub.conn;
          monitors.remove_sub(conn, &sub.sub_id);
          handoffs.retain(|h| h.conn != conn || h.sub_id != sub.sub_id);
          let live =
            monitors.conn_subs(conn) + handoffs.iter().filter(|h| h.conn == conn).count();
          if let Err(e) = queries.add_sub(sub, latest, live) {
            tracing::debug!(%conn, error = %e, "subscription refused");
            out(Delivery::Notice { conn, message: TOO_MANY_REQS.to_owned() });
          }
        }
        WorkerMsg::RemoveSub { conn, sub_id } => {
          queries.remove_sub(conn, &sub_id);
          monitors.remove_sub(conn, &sub_id);
          handoffs.retain(|h| h.conn != conn || h.sub_id != sub_id);
        }
        WorkerMsg::CloseConn(conn) => {
          queries.close_conn(conn);
          monitors.close_conn(conn);
          handoffs.retain(|h| h.conn != conn);
        }
        WorkerMsg::DbChange => {
          if let Err(e) = dispatch(&snap, monitors, current_seq, latest, &mut out) {
            tracing::warn!(error = %e, after = *current_seq, "live dispatch failed");
            redispatch = true;
            failure = failure.or(Some(e));
          }
        }
      }
    }
    if redispatch {
      pending.push_back(WorkerMsg::DbChange);
    }

    let done = queries.process(&snap, |sub, seq| {
      out(Delivery::Event { conn: sub.conn, sub_id: sub.sub_id.clone(), seq })
    });
    match done {
      Ok(Some(sub)) => {
        out(Delivery::Eose { conn: sub.conn, sub_id: sub.sub_id.clone() });
        handoffs.push_back(sub);
      }
      Ok(None) => {}
      Err(e) => {
        tracing::warn!(error = %e, "query slice failed");
        failure = failure.or(Some(e));
      }
    }

    if let Err(e) = install_handoffs(&snap, monitors, handoffs, *current_seq, &mut out) {
      tracing::warn!(error = %e, "catch-up replay failed");
      failure = failure.or(Some(e));
    }

    failure.map_or(Ok(()), Err)
  }
}

/// Send every event after `current_seq` through the monitors. On failure
/// `current_seq` is left at the last event dispatched, so a retry neither
/// skips nor repeats anything.
fn dispatch<S: Snapshot>(
  snap: &S,
  monitors: &mut ActiveMonitors,
  current_seq: &mut u64,
  latest: u64,
  out: &mut impl FnMut(Delivery),
) -> Result<()> {
  let mut dispatched = *current_seq;
  let walked = snap.events_after(*current_seq, &mut |seq, ev| {
    let recipients = monitors.dispatch(seq, ev);
    if !recipients.is_empty() {
      out(Delivery::Live { recipients, seq });
    }
    dispatched = seq;
    true
  });
  match walked {
    Ok(()) => {
      *current_seq = latest;
      Ok(())
    }
    Err(e) => {
      *current_seq = dispatched;
      Err(Error::store(e))
    }
  }
}

/// Move finished replays into the monitor, in completion order.
///
/// The monitor may already be past a subscription's snapshot, so the
/// events in between are replayed first. A replay that fails keeps its
/// progress and stays queued, along with everything behind it.
fn install_handoffs<S: Snapshot>(
  snap: &S,
  monitors: &mut ActiveMonitors,
  handoffs: &mut VecDeque<Subscription>,
  current_seq: u64,
  out: &mut impl FnMut(Delivery),
) -> Result<()> {
  while let Some(mut sub) = handoffs.pop_front() {
    if sub.latest_seq < current_seq {
      let recipient = sub.recipient();
      let filters = &sub.filters;
      let mut replayed = sub.latest_seq;
      let walked = snap.events_after(sub.latest_seq, &mut |seq, ev| {
        if seq > current_seq {
          return false;
        }
        if filters.matches(ev) {
          out(Delivery::Live { recipients: vec![recipient.clone()], seq });
        }
        replayed = seq;
        true
      });
      if let Err(e) = walked {
        sub.latest_seq = replayed;
        handoffs.push_front(sub);
        return Err(Error::store(e));
      }
      sub.latest_seq = current_seq;
    }

    let conn = sub.conn;
    if let Err(e) = monitors.install(sub) {
      tracing::warn!(%conn, error = %e, "monitor rejected subscription");
      out(Delivery::Notice { conn, message: TOO_MANY_REQS.to_owned() });
    }
  }
  Ok(())
}

// ─── WorkerPool ──────────────────────────────────────────────────────────────

/// A fixed set of worker threads. Subscriptions are sharded by connection.
#[derive(Debug)]
pub struct WorkerPool {
  inboxes: Vec<UnboundedSender<WorkerMsg>>,
  threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
  /// Start `config.num_workers` threads, each with its own read handle on
  /// `store`. Every worker's output is sent to `deliveries`.
  pub fn spawn<S: EventStore>(
    store: &S,
    config: QueryConfig,
    deliveries: UnboundedSender<Delivery>,
  ) -> Result<Self> {
    let n = config.num_workers.max(1);
    let mut inboxes = Vec::with_capacity(n);
    let mut threads = Vec::with_capacity(n);

    for id in 0..n {
      let handle = store.read_handle().map_err(Error::store)?;
      let worker = Worker::new(handle, config.clone());
      let (tx, rx) = mpsc::unbounded_channel();
      let out = deliveries.clone();

      let thread = thread::Builder::new()
        .name(format!("kestrel-worker-{id}"))
        .spawn(move || run(id, worker, rx, out))?;
      inboxes.push(tx);
      threads.push(thread);
    }

    tracing::info!(workers = n, "worker pool started");
    Ok(Self { inboxes, threads })
  }

  pub fn num_workers(&self) -> usize { self.inboxes.len() }

  /// Route `msg` to the worker owning its connection; broadcasts go to all.
  pub fn send(&self, msg: WorkerMsg) {
    match msg.conn() {
      Some(conn) => {
        let shard = (conn.0 % self.inboxes.len() as u64) as usize;
        if self.inboxes[shard].send(msg).is_err() {
          tracing::warn!(%conn, shard, "worker has stopped; message dropped");
        }
      }
      None => self.notify_db_change(),
    }
  }

  pub fn notify_db_change(&self) {
    for inbox in &self.inboxes {
      let _ = inbox.send(WorkerMsg::DbChange);
    }
  }

  /// Close every inbox and wait for the threads to exit.
  pub fn shutdown(self) {
    drop(self.inboxes);
    for thread in self.threads {
      if thread.join().is_err() {
        tracing::error!("worker thread panicked");
      }
    }
  }
}

fn run<H: ReadHandle>(
  id: usize,
  mut worker: Worker<H>,
  mut inbox: UnboundedReceiver<WorkerMsg>,
  out: UnboundedSender<Delivery>,
) {
  let mut closed = false;
  while !closed {
    let mut msgs = Vec::new();
    if worker.is_idle() {
      match inbox.blocking_recv() {
        Some(msg) => msgs.push(msg),
        None => break,
      }
    }
    loop {
      match inbox.try_recv() {
        Ok(msg) => msgs.push(msg),
        Err(TryRecvError::Empty) => break,
        Err(TryRecvError::Disconnected) => {
          closed = true;
          break;
        }
      }
    }

    if let Err(e) = worker.step(msgs, |d| {
      let _ = out.send(d);
    }) {
      tracing::error!(worker = id, error = %e, "worker step failed");
      thread::sleep(ERROR_BACKOFF);
    }
  }
  tracing::debug!(worker = id, "worker stopped");
}
