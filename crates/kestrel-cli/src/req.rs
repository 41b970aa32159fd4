//! `kestrel req`

use std::time::Duration;

use anyhow::Context as _;
use kestrel_core::{ConnId, EventStore, FilterGroup, ReadHandle, SubId, Subscription};
use kestrel_query::{Delivery, QueryConfig, WorkerMsg, WorkerPool};
use kestrel_store_sqlite::{SqliteReader, SqliteStore};
use tokio::sync::mpsc;

use crate::output;

const CONN: ConnId = ConnId(0);

pub async fn run(
  store: SqliteStore,
  relay: QueryConfig,
  group: FilterGroup,
  poll: Duration,
) -> anyhow::Result<()> {
  let sub_id = SubId::new("req")?;
  let (tx, mut deliveries) = mpsc::unbounded_channel();
  let pool = WorkerPool::spawn(&store, relay, tx).context("failed to start workers")?;
  let mut reader = store.read_handle().context("failed to open reader")?;

  pool.send(WorkerMsg::NewSub(Subscription::new(CONN, sub_id.clone(), group)));

  let mut seen = store.latest_seq().await?;
  let mut ticker = tokio::time::interval(poll);
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      Some(delivery) = deliveries.recv() => print(&mut reader, &sub_id, delivery)?,
      _ = ticker.tick() => {
        let latest = store.latest_seq().await?;
        if latest > seen {
          seen = latest;
          pool.notify_db_change();
        }
      }
      _ = &mut ctrl_c => break,
    }
  }

  pool.send(WorkerMsg::CloseConn(CONN));
  tokio::task::spawn_blocking(move || pool.shutdown())
    .await
    .context("worker shutdown failed")?;
  Ok(())
}

fn print(reader: &mut SqliteReader, sub_id: &SubId, delivery: Delivery) -> anyhow::Result<()> {
  let seq = match delivery {
    Delivery::Event { seq, .. } => seq,
    Delivery::Live { recipients, seq } => {
      if !recipients.iter().any(|r| r.conn == CONN && &r.sub_id == sub_id) {
        return Ok(());
      }
      seq
    }
    Delivery::Eose { .. } => return Ok(output::eose(sub_id)?),
    Delivery::Notice { message, .. } => return Ok(output::notice(&message)?),
  };

  let snap = reader.snapshot()?;
  if let Some(json) = snap.event_json(seq)? {
    output::event(sub_id, &json)?;
  }
  Ok(())
}
