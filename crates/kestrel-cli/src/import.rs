//! `kestrel import`

use std::path::Path;

use anyhow::Context as _;
use kestrel_store_sqlite::{Error, SqliteStore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader};

pub async fn run(store: &SqliteStore, file: Option<&Path>) -> anyhow::Result<()> {
  let input: Box<dyn AsyncBufRead + Unpin> = match file {
    Some(path) => {
      let f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
      Box::new(BufReader::new(f))
    }
    None => Box::new(BufReader::new(tokio::io::stdin())),
  };

  let mut lines = input.lines();
  let (mut added, mut duplicates, mut rejected) = (0u64, 0u64, 0u64);
  let mut line_no = 0u64;

  while let Some(line) = lines.next_line().await.context("failed to read input")? {
    line_no += 1;
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    match store.insert_json(line).await {
      Ok(Some(seq)) => {
        added += 1;
        tracing::debug!(seq, "event imported");
      }
      Ok(None) => duplicates += 1,
      Err(e @ (Error::Json(_) | Error::Core(_))) => {
        rejected += 1;
        tracing::warn!(line = line_no, error = %e, "event rejected");
      }
      Err(e) => return Err(e).context("failed to store event"),
    }
  }

  tracing::info!(added, duplicates, rejected, "import complete");
  Ok(())
}
