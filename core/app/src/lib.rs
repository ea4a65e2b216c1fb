//! BizSync application layer
//!
//! Binds the sync engine to per-resource, UI-facing state:
//! - Strategies validating and shaping writes per business vertical
//! - Resource handles with optimistic writes and fenced reconciliation
//! - An explicitly constructed context instead of a global engine

pub mod context;
pub mod facade;
pub mod strategy;

pub use context::{ContextOptions, SyncContext};
pub use bizsync_common::TEMP_ID_PREFIX;
pub use facade::{ResourceHandle, ResourceView};
pub use strategy::{PermissiveStrategy, RuleStrategy, Strategy, ValidationResult};
