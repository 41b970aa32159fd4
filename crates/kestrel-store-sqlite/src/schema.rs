//! SQL schema for the kestrel SQLite store.
//!
//! Executed once when the writer connection opens. Every secondary index is
//! its own `WITHOUT ROWID` table whose primary key is `(k, seq)`, so a
//! descending range walk is a plain b-tree traversal.

use kestrel_core::IndexKind;
use strum::IntoEnumIterator;

/// Tables shared by every index layout; idempotent thanks to
/// `CREATE TABLE IF NOT EXISTS`.
const BASE: &str = "
PRAGMA journal_mode = WAL;

-- Single row. Seqs are handed out from here and never reused.
CREATE TABLE IF NOT EXISTS meta (
    id       INTEGER PRIMARY KEY CHECK (id = 0),
    last_seq INTEGER NOT NULL
);
INSERT OR IGNORE INTO meta (id, last_seq) VALUES (0, 0);

CREATE TABLE IF NOT EXISTS events (
    seq        INTEGER PRIMARY KEY,
    id         BLOB    NOT NULL UNIQUE,
    author     BLOB    NOT NULL,
    created_at INTEGER NOT NULL,   -- u64 bit pattern
    kind       INTEGER NOT NULL,   -- u64 bit pattern
    expiration INTEGER,
    tags       BLOB    NOT NULL,   -- packed: name(1) len(1) value(len)
    json       TEXT    NOT NULL    -- event as received
);
";

/// Table holding one secondary index.
pub fn table_name(index: IndexKind) -> &'static str {
  match index {
    IndexKind::Id => "idx_id",
    IndexKind::Author => "idx_author",
    IndexKind::Kind => "idx_kind",
    IndexKind::AuthorKind => "idx_author_kind",
    IndexKind::Tag => "idx_tag",
    IndexKind::CreatedAt => "idx_created_at",
  }
}

/// Full schema DDL.
pub fn schema() -> String {
  let mut ddl = BASE.to_owned();
  for index in IndexKind::iter() {
    ddl.push_str(&format!(
      "CREATE TABLE IF NOT EXISTS {} (
           k   BLOB    NOT NULL,
           seq INTEGER NOT NULL,
           PRIMARY KEY (k, seq)
       ) WITHOUT ROWID;\n",
      table_name(index)
    ));
  }
  ddl.push_str("PRAGMA user_version = 1;\n");
  ddl
}
