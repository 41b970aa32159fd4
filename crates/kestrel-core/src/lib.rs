//! Core types for the kestrel event relay.
//!
//! Events, filters, subscriptions, the secondary-index key layouts and the
//! storage traits the query engine reads through. This crate is free of
//! database and runtime dependencies; the query engine and storage backends
//! depend on it.

pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod memory;
pub mod store;
pub mod subscription;

pub use error::{Error, FilterError, Result};
pub use event::{Event, Id32, Tag};
pub use filter::{Filter, FilterGroup, FilterSet, PrimaryField};
pub use keys::IndexKind;
pub use memory::MemoryStore;
pub use store::{EventStore, ReadHandle, Snapshot};
pub use subscription::{ConnId, Recipient, SubId, Subscription};
