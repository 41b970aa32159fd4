//! SQLite backend for the kestrel event store.
//!
//! Writes go through [`tokio_rusqlite`] so they never block the async
//! runtime. Each query worker reads through its own synchronous connection,
//! one deferred transaction per snapshot.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{SqliteReader, SqliteSnapshot, SqliteStore};

#[cfg(test)]
mod tests;
