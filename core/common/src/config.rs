//! Per-resource sync configuration.

use serde::{Deserialize, Serialize};

use crate::types::{Operation, Priority};

/// Default interval between background refreshes of a resource.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
/// Default age after which a cached read is considered stale (24h).
pub const DEFAULT_MAX_OFFLINE_AGE_MS: u64 = 86_400_000;

/// Path templates per operation. Templates may contain `{businessType}` and `:id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplates {
    #[serde(default)]
    pub get: Option<String>,
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub update: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
}

impl EndpointTemplates {
    /// Conventional REST layout: collection path for get/create, `/:id` for update/delete.
    pub fn rest(collection: impl Into<String>) -> Self {
        let collection = collection.into();
        Self {
            get: Some(collection.clone()),
            create: Some(collection.clone()),
            update: Some(format!("{}/:id", collection)),
            delete: Some(format!("{}/:id", collection)),
        }
    }

    /// Template for an operation; `Read` maps to `get`.
    pub fn for_operation(&self, operation: Operation) -> Option<&str> {
        match operation {
            Operation::Read => self.get.as_deref(),
            Operation::Create => self.create.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
        }
    }

    /// Whether any write endpoint is configured.
    pub fn has_write_endpoint(&self) -> bool {
        self.create.is_some() || self.update.is_some() || self.delete.is_some()
    }
}

/// Configuration of one registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub name: String,
    pub enable_offline: bool,
    pub sync_interval_ms: u64,
    /// `None` disables staleness checks for this resource.
    pub max_offline_age_ms: Option<u64>,
    pub priority: Priority,
    pub requires_auth: bool,
    pub endpoints: EndpointTemplates,
    pub push_event_names: Vec<String>,
    pub requires_date_range: bool,
    pub supports_pagination: bool,
}

impl ResourceConfig {
    /// Configuration with documented defaults and no endpoints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable_offline: true,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            max_offline_age_ms: Some(DEFAULT_MAX_OFFLINE_AGE_MS),
            priority: Priority::Normal,
            requires_auth: false,
            endpoints: EndpointTemplates::default(),
            push_event_names: Vec::new(),
            requires_date_range: false,
            supports_pagination: false,
        }
    }

    pub fn with_endpoints(mut self, endpoints: EndpointTemplates) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn with_push_events(mut self, names: Vec<String>) -> Self {
        self.push_event_names = names;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_offline_age_ms(mut self, max_age: Option<u64>) -> Self {
        self.max_offline_age_ms = max_age;
        self
    }

    /// First declared push event name, used as the outbound message type.
    pub fn primary_push_event(&self) -> Option<&str> {
        self.push_event_names.first().map(String::as_str)
    }
}

/// Partial configuration merged over [`ResourceConfig`] defaults at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceOverrides {
    pub enable_offline: Option<bool>,
    pub sync_interval_ms: Option<u64>,
    pub max_offline_age_ms: Option<Option<u64>>,
    pub priority: Option<Priority>,
    pub requires_auth: Option<bool>,
    pub endpoints: Option<EndpointTemplates>,
    pub push_event_names: Option<Vec<String>>,
    pub requires_date_range: Option<bool>,
    pub supports_pagination: Option<bool>,
}

impl ResourceOverrides {
    /// Merge these overrides over `base`.
    pub fn apply(self, mut base: ResourceConfig) -> ResourceConfig {
        if let Some(v) = self.enable_offline {
            base.enable_offline = v;
        }
        if let Some(v) = self.sync_interval_ms {
            base.sync_interval_ms = v;
        }
        if let Some(v) = self.max_offline_age_ms {
            base.max_offline_age_ms = v;
        }
        if let Some(v) = self.priority {
            base.priority = v;
        }
        if let Some(v) = self.requires_auth {
            base.requires_auth = v;
        }
        if let Some(v) = self.endpoints {
            base.endpoints = v;
        }
        if let Some(v) = self.push_event_names {
            base.push_event_names = v;
        }
        if let Some(v) = self.requires_date_range {
            base.requires_date_range = v;
        }
        if let Some(v) = self.supports_pagination {
            base.supports_pagination = v;
        }
        base
    }
}
