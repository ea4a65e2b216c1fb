//! Request/response adapter.

use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use bizsync_common::{
    item_id, wire_payload, BusinessType, Error, Operation, ResourceConfig, Result,
};
use bizsync_events::{names, EventBus};

use crate::endpoint::resolve_endpoint;
use crate::http::{ApiRequest, HttpMethod, RequestTransport};

/// Default page size for paginated resources.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Options for a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Skip the local cache when online.
    pub force: bool,
    /// Fetch a single entity (fills `:id` in the get template).
    pub id: Option<String>,
    /// Extra query parameters.
    pub query: BTreeMap<String, String>,
    /// Inclusive `(start, end)`; defaults to today for resources that require one.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    /// Query parameters for `config`, sorted by key.
    ///
    /// Date-range resources always carry `startDate`/`endDate`; paginated
    /// resources always carry `page`/`limit`.
    pub fn to_query(&self, config: &ResourceConfig) -> Vec<(String, String)> {
        let mut query = self.query.clone();

        if config.requires_date_range {
            let (start, end) = self.date_range.unwrap_or_else(|| {
                let today = Utc::now().date_naive();
                (today, today)
            });
            query.insert("startDate".into(), start.format(DATE_FORMAT).to_string());
            query.insert("endDate".into(), end.format(DATE_FORMAT).to_string());
        }

        if config.supports_pagination {
            query.insert("page".into(), self.page.unwrap_or(1).to_string());
            query.insert(
                "limit".into(),
                self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
            );
        }

        query.into_iter().collect()
    }
}

/// REST-style adapter over two request channels.
///
/// Resources with `requires_auth` go through the authenticated channel,
/// everything else through the public one.
#[derive(Clone)]
pub struct RestAdapter {
    authenticated: Arc<dyn RequestTransport>,
    public: Arc<dyn RequestTransport>,
    bus: EventBus,
}

impl RestAdapter {
    pub fn new(
        authenticated: Arc<dyn RequestTransport>,
        public: Arc<dyn RequestTransport>,
        bus: EventBus,
    ) -> Self {
        Self {
            authenticated,
            public,
            bus,
        }
    }

    fn channel(&self, config: &ResourceConfig) -> &dyn RequestTransport {
        if config.requires_auth {
            self.authenticated.as_ref()
        } else {
            self.public.as_ref()
        }
    }

    /// Build the write request for a stamped payload.
    pub fn write_request(
        resource: &str,
        data: &Value,
        config: &ResourceConfig,
        business_type: Option<&BusinessType>,
    ) -> Result<ApiRequest> {
        let operation = Operation::from_payload(data);
        let template = config.endpoints.for_operation(operation).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Resource '{}' has no {} endpoint",
                resource,
                operation.as_str()
            ))
        })?;

        let id = item_id(data);
        let path = resolve_endpoint(template, business_type, id.as_deref())?;
        let request = ApiRequest::new(HttpMethod::for_operation(operation), path);

        Ok(match operation {
            Operation::Delete | Operation::Read => request,
            Operation::Create | Operation::Update => request.with_body(wire_payload(data)),
        })
    }

    /// Deliver one write.
    ///
    /// Emits `datasync:api-synced` and `{resource}:api-update` on success,
    /// `datasync:sync-failed` on failure.
    pub async fn sync_via_api(
        &self,
        resource: &str,
        data: &Value,
        config: &ResourceConfig,
        business_type: Option<&BusinessType>,
    ) -> Result<Value> {
        let operation = Operation::from_payload(data);
        let result = match Self::write_request(resource, data, config, business_type) {
            Ok(request) => {
                debug!("{} {} ({})", request.method, request.path, resource);
                self.channel(config).execute(request).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                info!("Synced {} {} via API", operation.as_str(), resource);
                self.bus.emit(
                    names::API_SYNCED,
                    json!({
                        "resource": resource,
                        "operation": operation,
                        "response": response,
                    }),
                );
                self.bus.emit(
                    names::api_update(resource),
                    json!({ "resource": resource, "operation": operation }),
                );
                Ok(response)
            }
            Err(e) => {
                error!("API sync of {} failed: {}", resource, e);
                self.bus.emit(
                    names::SYNC_FAILED,
                    json!({
                        "resource": resource,
                        "operation": operation,
                        "channel": "api",
                        "error": e.to_string(),
                        "kind": e.kind(),
                        "retryable": e.is_retryable(),
                    }),
                );
                Err(e)
            }
        }
    }

    /// GET a resource (or one entity of it).
    ///
    /// Emits `datasync:api-fetched` on success, `datasync:api-error` on failure.
    pub async fn fetch_from_api(
        &self,
        resource: &str,
        options: &FetchOptions,
        config: &ResourceConfig,
        business_type: Option<&BusinessType>,
    ) -> Result<Value> {
        let result = match config.endpoints.get.as_deref() {
            Some(template) => match resolve_endpoint(template, business_type, options.id.as_deref()) {
                Ok(path) => {
                    let request =
                        ApiRequest::new(HttpMethod::Get, path).with_query(options.to_query(config));
                    debug!("GET {} ({})", request.path, resource);
                    self.channel(config).execute(request).await
                }
                Err(e) => Err(e),
            },
            None => Err(Error::InvalidInput(format!(
                "Resource '{}' has no get endpoint",
                resource
            ))),
        };

        match result {
            Ok(data) => {
                self.bus.emit(
                    names::API_FETCHED,
                    json!({ "resource": resource, "data": data }),
                );
                Ok(data)
            }
            Err(e) => {
                error!("Fetch of {} failed: {}", resource, e);
                self.bus.emit(
                    names::API_ERROR,
                    json!({
                        "resource": resource,
                        "error": e.to_string(),
                        "kind": e.kind(),
                        "retryable": e.is_retryable(),
                    }),
                );
                Err(e)
            }
        }
    }
}
