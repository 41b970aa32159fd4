//! `kestrel`: the command-line front end for the kestrel event store.
//!
//! # Usage
//!
//! ```text
//! kestrel import --file events.jsonl
//! kestrel scan '{"kinds":[1],"limit":10}'
//! kestrel scan --count --metrics '[{"#t":["rust"]},{"authors":["<hex>"]}]'
//! kestrel req '{"kinds":[1]}'
//! ```
//!
//! Settings are read from `kestrel.toml` (or `--config`) and `KESTREL_*`
//! environment variables.

mod config;
mod import;
mod output;
mod req;
mod scan;

use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kestrel_core::FilterGroup;
use kestrel_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(name = "kestrel", version, about = "Kestrel event store tools")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "kestrel.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store newline-delimited event JSON.
  Import {
    /// Read from this file instead of stdin.
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,
  },

  /// Replay stored events matching a filter (or array of filters), newest
  /// first.
  Scan {
    /// Filter JSON.
    filter: String,

    /// Time slice per scheduling turn, in microseconds.
    #[arg(long, value_name = "US")]
    pause: Option<u64>,

    /// Log per-filter scan metrics at info level.
    #[arg(long)]
    metrics: bool,

    /// Print only the number of matches.
    #[arg(long)]
    count: bool,
  },

  /// Replay then follow: print stored matches, `EOSE`, then new matches as
  /// they are imported.
  Req {
    /// Filter JSON.
    filter: String,

    /// How often to check the store for new events, in milliseconds.
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let settings = Settings::load(&cli.config)?;

  let store = SqliteStore::open(&settings.db_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.db_path))?;

  match cli.command {
    Command::Import { file } => import::run(&store, file.as_deref()).await,
    Command::Scan { filter, pause, metrics, count } => {
      let group = parse_filter(&filter, &settings)?;
      let mut relay = settings.relay;
      if let Some(us) = pause {
        relay.query_timeslice_budget_us = us;
      }
      relay.logging.db_scan_perf |= metrics;
      tokio::task::spawn_blocking(move || scan::run(&store, &relay, group, count))
        .await
        .context("scan task failed")?
    }
    Command::Req { filter, poll_ms } => {
      let group = parse_filter(&filter, &settings)?;
      req::run(store, settings.relay, group, Duration::from_millis(poll_ms)).await
    }
  }
}

fn parse_filter(raw: &str, settings: &Settings) -> anyhow::Result<FilterGroup> {
  let v: serde_json::Value = serde_json::from_str(raw).context("filter is not valid JSON")?;
  FilterGroup::from_json(&v, settings.relay.max_filter_limit).context("invalid filter")
}
