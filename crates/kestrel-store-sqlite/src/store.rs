//! [`SqliteStore`]: the SQLite implementation of [`EventStore`].

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use kestrel_core::{
  Event, EventStore, IndexKind, ReadHandle, Snapshot, keys::index_entries,
};
use rusqlite::{OpenFlags, OptionalExtension as _, TransactionBehavior, params};
use strum::IntoEnumIterator as _;

use crate::{
  Error, Result,
  encode::{EVENT_COLUMNS, RawEvent, encode_u64, pack_tags, seq_bound},
  schema::{schema, table_name},
};

/// How long a reader waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A kestrel event store backed by a single SQLite file in WAL mode.
///
/// Cloning is cheap; all clones share one writer connection.
#[derive(Clone)]
pub struct SqliteStore {
  path:   Arc<PathBuf>,
  writer: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let writer = tokio_rusqlite::Connection::open(&path).await?;
    let store = Self { path: Arc::new(path), writer };
    store.init_schema().await?;
    tracing::debug!(path = %store.path.display(), "sqlite store opened");
    Ok(store)
  }

  pub fn path(&self) -> &Path { &self.path }

  async fn init_schema(&self) -> Result<()> {
    let ddl = schema();
    self
      .writer
      .call(move |conn| {
        conn.execute_batch(&ddl)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Parse and store one event given as relay JSON. The text is kept
  /// verbatim for later output.
  ///
  /// Returns the new seq, or `None` if an event with the same id exists.
  pub async fn insert_json(&self, raw: &str) -> Result<Option<u64>> {
    let v: serde_json::Value = serde_json::from_str(raw)?;
    let ev = Event::from_json(&v)?;
    self.insert_raw(ev, raw.to_owned()).await
  }

  /// Store an already-parsed event.
  pub async fn insert(&self, ev: &Event) -> Result<Option<u64>> {
    self.insert_raw(ev.clone(), ev.to_json().to_string()).await
  }

  async fn insert_raw(&self, ev: Event, json: String) -> Result<Option<u64>> {
    let tags = pack_tags(&ev.tags)?;

    let seq = self
      .writer
      .call(move |conn| {
        let tx = conn.transaction()?;

        let id = ev.id.as_bytes().as_slice();
        let exists = tx
          .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |_| Ok(()))
          .optional()?
          .is_some();
        if exists {
          return Ok(None);
        }

        let seq: i64 = tx.query_row(
          "UPDATE meta SET last_seq = last_seq + 1 WHERE id = 0 RETURNING last_seq",
          [],
          |r| r.get(0),
        )?;

        tx.execute(
          "INSERT INTO events (
             seq, id, author, created_at, kind, expiration, tags, json
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![
            seq,
            id,
            ev.author.as_bytes().as_slice(),
            encode_u64(ev.created_at),
            encode_u64(ev.kind),
            ev.expiration.map(encode_u64),
            tags,
            json,
          ],
        )?;

        for (index, key) in index_entries(&ev) {
          let sql = format!(
            "INSERT OR IGNORE INTO {} (k, seq) VALUES (?1, ?2)",
            table_name(index)
          );
          tx.prepare_cached(&sql)?.execute(params![key, seq])?;
        }

        tx.commit()?;
        Ok(Some(seq as u64))
      })
      .await?;

    if let Some(seq) = seq {
      tracing::trace!(seq, "event stored");
    }
    Ok(seq)
  }

  /// Remove an event and its index rows. The seq is never reused.
  pub async fn delete(&self, seq: u64) -> Result<bool> {
    let seq = seq_bound(seq);
    let deleted = self
      .writer
      .call(move |conn| {
        let tx = conn.transaction()?;
        for index in IndexKind::iter() {
          tx.execute(
            &format!("DELETE FROM {} WHERE seq = ?1", table_name(index)),
            params![seq],
          )?;
        }
        let n = tx.execute("DELETE FROM events WHERE seq = ?1", params![seq])?;
        tx.commit()?;
        Ok(n > 0)
      })
      .await?;
    Ok(deleted)
  }

  /// Highest seq ever assigned.
  pub async fn latest_seq(&self) -> Result<u64> {
    let seq = self
      .writer
      .call(|conn| {
        let seq: i64 =
          conn.query_row("SELECT last_seq FROM meta WHERE id = 0", [], |r| r.get(0))?;
        Ok(seq)
      })
      .await?;
    Ok(seq as u64)
  }
}

impl EventStore for SqliteStore {
  type Error = crate::Error;
  type Handle = SqliteReader;

  fn read_handle(&self) -> Result<SqliteReader> {
    let conn = rusqlite::Connection::open_with_flags(
      self.path.as_ref(),
      OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(SqliteReader { conn })
  }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// A synchronous read connection owned by one worker.
pub struct SqliteReader {
  conn: rusqlite::Connection,
}

impl ReadHandle for SqliteReader {
  type Error = crate::Error;
  type Snapshot<'a> = SqliteSnapshot<'a>;

  fn snapshot(&mut self) -> Result<SqliteSnapshot<'_>> {
    let tx = self
      .conn
      .transaction_with_behavior(TransactionBehavior::Deferred)?;
    Ok(SqliteSnapshot { tx })
  }
}

/// One read transaction. Rolled back (a no-op) on drop.
pub struct SqliteSnapshot<'a> {
  tx: rusqlite::Transaction<'a>,
}

impl SqliteSnapshot<'_> {
  /// The event's JSON exactly as it was inserted.
  pub fn event_json(&self, seq: u64) -> Result<Option<String>> {
    let json = self
      .tx
      .prepare_cached("SELECT json FROM events WHERE seq = ?1")?
      .query_row(params![seq_bound(seq)], |r| r.get(0))
      .optional()?;
    Ok(json)
  }
}

impl Snapshot for SqliteSnapshot<'_> {
  type Error = crate::Error;

  fn latest_seq(&self) -> Result<u64> {
    let seq: i64 = self
      .tx
      .prepare_cached("SELECT last_seq FROM meta WHERE id = 0")?
      .query_row([], |r| r.get(0))?;
    Ok(seq as u64)
  }

  fn scan_back(
    &self,
    index: IndexKind,
    key: &[u8],
    seq: u64,
    visit: &mut dyn FnMut(&[u8], u64) -> bool,
  ) -> Result<bool> {
    let sql = format!(
      "SELECT k, seq FROM {} WHERE (k, seq) <= (?1, ?2) ORDER BY k DESC, seq DESC",
      table_name(index)
    );
    let mut stmt = self.tx.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![key, seq_bound(seq)])?;
    while let Some(row) = rows.next()? {
      let k: Vec<u8> = row.get(0)?;
      let s: i64 = row.get(1)?;
      if !visit(&k, s as u64) {
        return Ok(false);
      }
    }
    Ok(true)
  }

  fn event(&self, seq: u64) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE seq = ?1");
    let decoded = self
      .tx
      .prepare_cached(&sql)?
      .query_row(params![seq_bound(seq)], |row| Ok(RawEvent::decode(row)))
      .optional()?;
    match decoded {
      Some(decoded) => Ok(skip_corrupt(decoded)?.map(|(_, ev)| ev)),
      None => Ok(None),
    }
  }

  fn events_after(
    &self,
    after: u64,
    visit: &mut dyn FnMut(u64, &Event) -> bool,
  ) -> Result<()> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE seq > ?1 ORDER BY seq");
    let mut stmt = self.tx.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![seq_bound(after)])?;
    while let Some(row) = rows.next()? {
      let Some((seq, ev)) = skip_corrupt(RawEvent::decode(row))? else {
        continue;
      };
      if !visit(seq, &ev) {
        break;
      }
    }
    Ok(())
  }
}

/// A corrupt row reads as a missing event: it is logged and left out, and
/// the read carries on past it.
fn skip_corrupt(decoded: Result<(u64, Event)>) -> Result<Option<(u64, Event)>> {
  match decoded {
    Ok(found) => Ok(Some(found)),
    Err(Error::Corrupt { seq, reason }) => {
      tracing::warn!(seq, reason, "skipping corrupt event row");
      Ok(None)
    }
    Err(e) => Err(e),
  }
}
