//! Common types shared across the bizsync crates.
//!
//! This module provides the error taxonomy, resource identifiers and the
//! record/queue shapes that every other layer exchanges, so that the bus,
//! store, transports and orchestrator agree on a single vocabulary.

pub mod config;
pub mod error;
pub mod record;
pub mod types;

pub use config::{EndpointTemplates, ResourceConfig, ResourceOverrides};
pub use error::{Error, Result, StaleDataWarning};
pub use record::{
    apply_to_collection, empty_object, is_temp_id, item_id, now_millis, temp_id, wire_payload,
    CachedRecord, SyncMetadata, SyncQueueItem, TEMP_ID_PREFIX,
};
pub use types::{BusinessType, Operation, Priority, ResourceKind};
