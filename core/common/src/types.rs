//! Common types used throughout bizsync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Business vertical the application is currently operating as
/// (e.g. "salon", "retail", "restaurant").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessType(String);

impl BusinessType {
    /// Create a new BusinessType from a string.
    ///
    /// # Errors
    /// - Returns error if the type is empty or contains a path separator
    pub fn new(value: impl Into<String>) -> crate::Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "BusinessType cannot be empty".to_string(),
            ));
        }
        if value.contains('/') {
            return Err(crate::Error::InvalidInput(
                "BusinessType cannot contain '/'".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write/read operation carried by a sync envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
}

impl Operation {
    /// Field on a payload that carries the requested operation.
    pub const FIELD: &'static str = "_operation";

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "read" => Some(Operation::Read),
            _ => None,
        }
    }

    /// Resolve the operation a payload asks for, defaulting to `Update`.
    pub fn from_payload(payload: &Value) -> Self {
        payload
            .get(Self::FIELD)
            .and_then(Value::as_str)
            .and_then(Self::parse)
            .unwrap_or(Operation::Update)
    }

    /// Whether this operation mutates remote state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Read)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync priority of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Closed set of resources the normalizer knows how to shape.
///
/// Names outside this set map to `Unrecognized` and are passed through
/// untouched; they may still be registered and synced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Timeline,
    Clients,
    Invoices,
    Stock,
    Sales,
    Services,
    Appointments,
    Unrecognized(String),
}

impl ResourceKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "timeline" => ResourceKind::Timeline,
            "clients" => ResourceKind::Clients,
            "invoices" => ResourceKind::Invoices,
            "stock" => ResourceKind::Stock,
            "sales" => ResourceKind::Sales,
            "services" => ResourceKind::Services,
            "appointments" => ResourceKind::Appointments,
            other => ResourceKind::Unrecognized(other.to_string()),
        }
    }

    /// Canonical resource name.
    pub fn name(&self) -> &str {
        match self {
            ResourceKind::Timeline => "timeline",
            ResourceKind::Clients => "clients",
            ResourceKind::Invoices => "invoices",
            ResourceKind::Stock => "stock",
            ResourceKind::Sales => "sales",
            ResourceKind::Services => "services",
            ResourceKind::Appointments => "appointments",
            ResourceKind::Unrecognized(name) => name,
        }
    }

    /// Semantic type tag stamped on each normalized item.
    pub fn item_type(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Timeline => Some("timeline_entry"),
            ResourceKind::Clients => Some("client"),
            ResourceKind::Invoices => Some("invoice"),
            ResourceKind::Stock => Some("stock_item"),
            ResourceKind::Sales => Some("sale"),
            ResourceKind::Services => Some("service"),
            ResourceKind::Appointments => Some("appointment"),
            ResourceKind::Unrecognized(_) => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, ResourceKind::Unrecognized(_))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_business_type_creation() {
        let bt = BusinessType::new("salon").unwrap();
        assert_eq!(bt.as_str(), "salon");
        assert_eq!(bt.to_string(), "salon");
    }

    #[test]
    fn test_business_type_rejects_empty_and_separators() {
        assert!(BusinessType::new("").is_err());
        assert!(BusinessType::new("   ").is_err());
        assert!(BusinessType::new("a/b").is_err());
    }

    #[test]
    fn test_operation_from_payload_defaults_to_update() {
        assert_eq!(Operation::from_payload(&json!({"name": "x"})), Operation::Update);
        assert_eq!(
            Operation::from_payload(&json!({"_operation": "create"})),
            Operation::Create
        );
        assert_eq!(
            Operation::from_payload(&json!({"_operation": "bogus"})),
            Operation::Update
        );
    }

    #[test]
    fn test_resource_kind_round_trip_names() {
        for name in ["timeline", "clients", "invoices", "stock", "sales", "services", "appointments"] {
            let kind = ResourceKind::from_name(name);
            assert!(kind.is_recognized());
            assert_eq!(kind.name(), name);
            assert!(kind.item_type().is_some());
        }
        let other = ResourceKind::from_name("clinets");
        assert_eq!(other, ResourceKind::Unrecognized("clinets".into()));
        assert!(other.item_type().is_none());
    }

    #[test]
    fn test_priority_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
