//! Local durable store for bizsync.
//!
//! This module provides a trait-based interface for the cache of resource
//! records and the durable retry queue, plus an in-memory store (tests,
//! ephemeral sessions) and a JSON file store.
//!
//! # Design Principles
//! - Records are keyed by resource name and replaced wholesale on `put`
//! - The queue table preserves insertion order; updating an item keeps its slot
//! - All I/O is async

pub mod local;
pub mod memory;
pub mod store;

pub use local::LocalFileStore;
pub use memory::MemoryStore;
pub use store::LocalStore;
