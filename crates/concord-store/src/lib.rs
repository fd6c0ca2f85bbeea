//! Durable state for the Concord engine.
//!
//! The store is the only resource written by many concurrent writers (task
//! runtimes, cognitive agents, the cost controller). Every record carries a
//! version; writes with a stale version are rejected and writes to unrelated
//! records never contend.
//!
//! # Main types
//!
//! - [`StateStore`] — Storage contract used by every other crate.
//! - [`MemoryStateStore`] — In-process store for tests and ephemeral runs.
//! - [`FileStateStore`] — JSON files on disk, one per record.
//! - `SqliteStateStore` — SQLite-backed store (`sqlite` feature).

/// JSON-file store.
pub mod file;
/// In-memory store.
pub mod memory;
/// SQLite store.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// The storage contract and shared helpers.
pub mod store;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
pub use store::{Archive, RecordLocks, StateStore};
