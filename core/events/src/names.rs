//! Event names produced and consumed by the sync core.

pub const INITIALIZED: &str = "datasync:initialized";
pub const INIT_ERROR: &str = "datasync:init-error";
pub const ONLINE: &str = "datasync:online";
pub const OFFLINE: &str = "datasync:offline";
pub const SYNCED: &str = "datasync:synced";
pub const SYNC_FAILED: &str = "datasync:sync-failed";
pub const ERROR: &str = "datasync:error";
pub const QUEUE_PROCESSING: &str = "datasync:queue-processing";
pub const QUEUE_PROCESSED: &str = "datasync:queue-processed";
pub const QUEUE_FAILED: &str = "datasync:queue-failed";
pub const QUEUED: &str = "datasync:queued";
pub const API_SYNCED: &str = "datasync:api-synced";
pub const API_FETCHED: &str = "datasync:api-fetched";
pub const API_ERROR: &str = "datasync:api-error";
pub const SOCKET_CONNECTED: &str = "datasync:socket-connected";
pub const SOCKET_DISCONNECTED: &str = "datasync:socket-disconnected";
pub const SOCKET_ERROR: &str = "datasync:socket-error";
pub const SOCKET_MESSAGE: &str = "datasync:socket-message";
pub const BUSINESS_TYPE_SET: &str = "datasync:business-type-set";
pub const STALE_DATA: &str = "datasync:stale-data";
pub const CONFLICT: &str = "datasync:conflict";

/// Emitted when a subscriber fails during dispatch.
pub const BUS_ERROR: &str = "eventbus:error";

/// `{resource}:updated`, carrying the new collection and its source.
pub fn updated(resource: &str) -> String {
    format!("{resource}:updated")
}

/// `{resource}:socket-update`, republished from the push channel.
pub fn socket_update(resource: &str) -> String {
    format!("{resource}:socket-update")
}

/// `{resource}:api-update`, a server-side change observed over REST.
pub fn api_update(resource: &str) -> String {
    format!("{resource}:api-update")
}

pub fn created(resource: &str) -> String {
    format!("{resource}:created")
}

pub fn deleted(resource: &str) -> String {
    format!("{resource}:deleted")
}

/// `{resource}:changed`, the cross-feature change notification the
/// orchestrator listens to for registered resources.
pub fn changed(resource: &str) -> String {
    format!("{resource}:changed")
}
