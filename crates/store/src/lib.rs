//! Staging store backends for attempt-scoped authorization material.
//!
//! Provides an in-memory store for tests and single-process flows, and a
//! SQLite-backed store shared by every process taking part in a flow.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
