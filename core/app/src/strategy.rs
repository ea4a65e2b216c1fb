//! Business-vertical validation and permission rules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use bizsync_common::{item_id, Error, Operation, Result};

/// Outcome of validating one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert into a `Result`, failing with `Error::Validation`.
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(Error::Validation(self.errors))
        }
    }
}

/// Rules a business vertical applies to writes before they leave the client.
///
/// Payloads carry their intended operation in `_operation`.
pub trait Strategy: Send + Sync {
    fn get_name(&self) -> &str;

    fn validate_data(&self, payload: &Value, resource: &str) -> ValidationResult;

    /// Whether `operation` (`create`, `update`, `delete`) may run on `payload`.
    fn is_operation_allowed(&self, operation: &str, payload: &Value) -> bool;

    /// Final shaping of a payload before it is written.
    fn process_data(&self, payload: Value, resource: &str) -> Value;
}

/// Accepts every payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveStrategy;

impl Strategy for PermissiveStrategy {
    fn get_name(&self) -> &str {
        "permissive"
    }

    fn validate_data(&self, _payload: &Value, _resource: &str) -> ValidationResult {
        ValidationResult::valid()
    }

    fn is_operation_allowed(&self, _operation: &str, _payload: &Value) -> bool {
        true
    }

    fn process_data(&self, payload: Value, _resource: &str) -> Value {
        payload
    }
}

/// Table-driven strategy.
///
/// Creates must carry every required field of their resource; updates and
/// deletes must carry an `id`. Operations can be denied outright, and
/// missing fields filled from per-resource defaults.
#[derive(Debug, Clone, Default)]
pub struct RuleStrategy {
    name: String,
    required: BTreeMap<String, Vec<String>>,
    defaults: BTreeMap<String, Map<String, Value>>,
    denied: HashSet<String>,
}

impl RuleStrategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Rules shared by every vertical for the built-in resources.
    pub fn standard(name: impl Into<String>) -> Self {
        Self::new(name)
            .require("clients", &["name"])
            .require("invoices", &["clientId"])
            .require("stock", &["name"])
            .require("sales", &["total"])
            .require("services", &["name"])
            .require("appointments", &["clientId", "date"])
            .with_default("invoices", "status", Value::from("draft"))
            .with_default("appointments", "status", Value::from("scheduled"))
    }

    pub fn require(mut self, resource: &str, fields: &[&str]) -> Self {
        self.required
            .entry(resource.to_string())
            .or_default()
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_default(mut self, resource: &str, field: &str, value: Value) -> Self {
        self.defaults
            .entry(resource.to_string())
            .or_default()
            .insert(field.to_string(), value);
        self
    }

    pub fn deny(mut self, operation: Operation) -> Self {
        self.denied.insert(operation.as_str().to_string());
        self
    }
}

impl Strategy for RuleStrategy {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn validate_data(&self, payload: &Value, resource: &str) -> ValidationResult {
        let Some(obj) = payload.as_object() else {
            return ValidationResult::invalid(vec!["payload must be an object".to_string()]);
        };

        let mut errors = Vec::new();
        match Operation::from_payload(payload) {
            Operation::Create => {
                for field in self.required.get(resource).into_iter().flatten() {
                    if !is_present(obj.get(field)) {
                        errors.push(format!("{} is required", field));
                    }
                }
            }
            Operation::Update | Operation::Delete => {
                if item_id(payload).is_none() {
                    errors.push("id is required".to_string());
                }
            }
            Operation::Read => {}
        }
        ValidationResult::invalid(errors)
    }

    fn is_operation_allowed(&self, operation: &str, _payload: &Value) -> bool {
        !self.denied.contains(operation)
    }

    fn process_data(&self, mut payload: Value, resource: &str) -> Value {
        if let Some(obj) = payload.as_object_mut() {
            for value in obj.values_mut() {
                if let Value::String(s) = value {
                    let trimmed = s.trim();
                    if trimmed.len() != s.len() {
                        *s = trimmed.to_string();
                    }
                }
            }
            if let Some(defaults) = self.defaults.get(resource) {
                for (field, value) in defaults {
                    obj.entry(field.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        payload
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}
