//! Resource catalog.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use bizsync_common::{
    BusinessType, EndpointTemplates, Error, Priority, ResourceConfig, ResourceOverrides, Result,
};

/// Resources registered at startup, independent of the business vertical.
pub const GENERAL_RESOURCES: [&str; 2] = ["clients", "invoices"];

/// Resources registered once a business vertical is chosen.
pub const VERTICAL_RESOURCES: [&str; 5] = ["timeline", "stock", "sales", "services", "appointments"];

/// Catalog of per-resource configuration.
///
/// Re-registering a name replaces its configuration.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, ResourceConfig>>,
    business_type: RwLock<Option<BusinessType>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, merging `overrides` over the defaults.
    pub fn register_resource(
        &self,
        name: impl Into<String>,
        overrides: ResourceOverrides,
    ) -> ResourceConfig {
        let config = overrides.apply(ResourceConfig::new(name));
        self.register(config.clone());
        config
    }

    /// Register a fully built configuration.
    pub fn register(&self, config: ResourceConfig) {
        debug!("Registered resource {}", config.name);
        self.resources.write().insert(config.name.clone(), config);
    }

    /// Register the general resources.
    pub fn seed_general(&self) -> Vec<String> {
        GENERAL_RESOURCES
            .iter()
            .map(|name| {
                self.register(general_config(name));
                name.to_string()
            })
            .collect()
    }

    /// Set the active business vertical and (re)register its resources.
    ///
    /// Returns the names registered, or `None` if `business_type` was
    /// already active.
    pub fn set_business_type(&self, business_type: BusinessType) -> Option<Vec<String>> {
        {
            let mut current = self.business_type.write();
            if current.as_ref() == Some(&business_type) {
                debug!("Business type {} already active", business_type);
                return None;
            }
            *current = Some(business_type.clone());
        }

        info!("Business type set to {}", business_type);
        let names = VERTICAL_RESOURCES
            .iter()
            .map(|name| {
                self.register(vertical_config(name, &business_type));
                name.to_string()
            })
            .collect();
        Some(names)
    }

    pub fn business_type(&self) -> Option<BusinessType> {
        self.business_type.read().clone()
    }

    pub fn get_resource(&self, name: &str) -> Option<ResourceConfig> {
        self.resources.read().get(name).cloned()
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.read().contains_key(name)
    }

    /// Lookup that fails for unregistered names.
    ///
    /// # Errors
    /// - `UnregisteredResource` if `name` was never registered
    pub fn require(&self, name: &str) -> Result<ResourceConfig> {
        self.get_resource(name)
            .ok_or_else(|| Error::UnregisteredResource(name.to_string()))
    }

    /// Every registered configuration, high priority first, then by name.
    pub fn get_all_resources(&self) -> Vec<ResourceConfig> {
        let mut all: Vec<ResourceConfig> = self.resources.read().values().cloned().collect();
        all.sort_by(|a, b| {
            priority_rank(a.priority)
                .cmp(&priority_rank(b.priority))
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.get_all_resources().into_iter().map(|c| c.name).collect()
    }
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

fn general_config(name: &str) -> ResourceConfig {
    ResourceConfig::new(name)
        .with_auth(true)
        .with_priority(Priority::High)
        .with_endpoints(EndpointTemplates::rest(format!("/api/{{businessType}}/{}", name)))
        .with_push_events(vec![format!("{}:changed", name)])
}

fn vertical_config(name: &str, business_type: &BusinessType) -> ResourceConfig {
    let mut config = ResourceConfig::new(name)
        .with_auth(true)
        .with_endpoints(EndpointTemplates::rest(format!(
            "/api/{}/{}",
            business_type.as_str(),
            name
        )))
        .with_push_events(vec![format!("{}:changed", name)]);

    match name {
        "timeline" => {
            config.requires_date_range = true;
            // Timeline is read-only.
            config.endpoints.create = None;
            config.endpoints.update = None;
            config.endpoints.delete = None;
            config.push_event_names.clear();
        }
        "sales" => config.supports_pagination = true,
        "stock" => config = config.with_max_offline_age_ms(Some(3_600_000)),
        "appointments" => config = config.with_priority(Priority::High),
        _ => {}
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizsync_common::config::{DEFAULT_MAX_OFFLINE_AGE_MS, DEFAULT_SYNC_INTERVAL_MS};

    #[test]
    fn test_register_merges_defaults() {
        let registry = ResourceRegistry::new();
        let overrides = ResourceOverrides {
            requires_auth: Some(true),
            sync_interval_ms: Some(5_000),
            ..Default::default()
        };
        registry.register_resource("notes", overrides);

        let config = registry.get_resource("notes").unwrap();
        assert!(config.enable_offline);
        assert!(config.requires_auth);
        assert_eq!(config.sync_interval_ms, 5_000);
        assert_eq!(config.max_offline_age_ms, Some(DEFAULT_MAX_OFFLINE_AGE_MS));
        assert_eq!(config.priority, Priority::Normal);
        assert!(config.push_event_names.is_empty());
    }

    #[test]
    fn test_reregistering_overwrites() {
        let registry = ResourceRegistry::new();
        registry.register_resource(
            "notes",
            ResourceOverrides {
                sync_interval_ms: Some(1),
                ..Default::default()
            },
        );
        registry.register_resource("notes", ResourceOverrides::default());
        assert_eq!(
            registry.get_resource("notes").unwrap().sync_interval_ms,
            DEFAULT_SYNC_INTERVAL_MS
        );
    }

    #[test]
    fn test_unregistered_lookup_fails() {
        let registry = ResourceRegistry::new();
        assert!(!registry.has_resource("ghost"));
        assert!(matches!(
            registry.require("ghost"),
            Err(Error::UnregisteredResource(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_seed_general() {
        let registry = ResourceRegistry::new();
        registry.seed_general();

        let clients = registry.require("clients").unwrap();
        assert!(clients.requires_auth);
        assert_eq!(clients.endpoints.create.as_deref(), Some("/api/{businessType}/clients"));
        assert_eq!(clients.primary_push_event(), Some("clients:changed"));
        assert!(registry.has_resource("invoices"));
    }

    #[test]
    fn test_business_type_is_idempotent() {
        let registry = ResourceRegistry::new();
        let salon = BusinessType::new("salon").unwrap();

        let names = registry.set_business_type(salon.clone()).unwrap();
        assert_eq!(names.len(), VERTICAL_RESOURCES.len());
        assert!(registry.set_business_type(salon).is_none());

        let stock = registry.require("stock").unwrap();
        assert_eq!(stock.endpoints.get.as_deref(), Some("/api/salon/stock"));
        assert_eq!(stock.endpoints.update.as_deref(), Some("/api/salon/stock/:id"));

        let timeline = registry.require("timeline").unwrap();
        assert!(timeline.requires_date_range);
        assert!(!timeline.endpoints.has_write_endpoint());
        assert!(registry.require("sales").unwrap().supports_pagination);
    }

    #[test]
    fn test_switching_business_type_rewrites_templates() {
        let registry = ResourceRegistry::new();
        registry.set_business_type(BusinessType::new("salon").unwrap());
        registry.set_business_type(BusinessType::new("garage").unwrap());

        assert_eq!(
            registry.require("services").unwrap().endpoints.get.as_deref(),
            Some("/api/garage/services")
        );
        assert_eq!(registry.business_type().unwrap().as_str(), "garage");
    }

    #[test]
    fn test_all_resources_ordered_by_priority() {
        let registry = ResourceRegistry::new();
        registry.register_resource(
            "zeta",
            ResourceOverrides {
                priority: Some(Priority::High),
                ..Default::default()
            },
        );
        registry.register_resource("alpha", ResourceOverrides::default());
        registry.register_resource(
            "beta",
            ResourceOverrides {
                priority: Some(Priority::Low),
                ..Default::default()
            },
        );
        assert_eq!(registry.names(), vec!["zeta", "alpha", "beta"]);
    }
}
