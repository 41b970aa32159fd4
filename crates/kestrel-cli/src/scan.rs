//! `kestrel scan`

use anyhow::Context as _;
use kestrel_core::{ConnId, EventStore, FilterGroup, ReadHandle, Snapshot, SubId, Subscription};
use kestrel_query::{DbQuery, QueryConfig};
use kestrel_store_sqlite::SqliteStore;

use crate::output;

/// Run a historical query to completion, one time slice per snapshot.
pub fn run(
  store: &SqliteStore,
  relay: &QueryConfig,
  group: FilterGroup,
  count_only: bool,
) -> anyhow::Result<()> {
  let sub_id = SubId::new("scan")?;
  let mut sub = Subscription::new(ConnId(0), sub_id.clone(), group);
  let mut reader = store.read_handle().context("failed to open reader")?;

  sub.latest_seq = reader.snapshot()?.latest_seq()?;
  let mut query = DbQuery::new(sub, relay.author_kind_cap, relay.logging.db_scan_perf);

  let mut total = 0u64;
  let mut slices = 0u64;
  loop {
    let snap = reader.snapshot()?;
    let mut found = Vec::new();
    let done = query.process(&snap, relay.timeslice_budget(), |_, seq| found.push(seq))?;
    slices += 1;

    total += found.len() as u64;
    if !count_only {
      for seq in found {
        // Deleted since the scan saw it.
        let Some(json) = snap.event_json(seq)? else { continue };
        output::event(&sub_id, &json)?;
      }
    }

    if done {
      break;
    }
  }

  if count_only {
    println!("{total}");
  }
  tracing::debug!(total, slices, "scan finished");
  Ok(())
}
