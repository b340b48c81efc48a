//! [`ScaleSetClient`] over the Azure Resource Manager REST API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument};

use fleet_common::retry::{retry_with_backoff, RetryConfig};
use fleet_common::{Error, Result};
use fleet_upgrade::{Operation, OperationStatus, ScaleSet, ScaleSetClient, TargetModel, VmInstance};

use crate::auth::{AzureCredentials, TokenProvider, DEFAULT_LOGIN_ENDPOINT};
use crate::model;

/// Default ARM endpoint
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Compute API version used for every call
pub const API_VERSION: &str = "2024-07-01";

const ASYNC_OPERATION: &str = "azure-asyncoperation";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const READ_ATTEMPTS: u32 = 4;

/// Endpoints the client talks to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AzureEndpoints {
    /// ARM base URL
    pub management: String,
    /// Identity platform base URL
    pub login: String,
}

impl Default for AzureEndpoints {
    fn default() -> Self {
        Self {
            management: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            login: DEFAULT_LOGIN_ENDPOINT.to_string(),
        }
    }
}

/// Scale sets of one resource group
pub struct AzureScaleSetClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    base_url: String,
}

impl AzureScaleSetClient {
    /// Client for the scale sets in `resource_group`
    pub fn new(credentials: AzureCredentials, resource_group: &str) -> Result<Self> {
        Self::with_endpoints(credentials, resource_group, AzureEndpoints::default())
    }

    /// Client against non-default endpoints (sovereign clouds)
    pub fn with_endpoints(
        credentials: AzureCredentials,
        resource_group: &str,
        endpoints: AzureEndpoints,
    ) -> Result<Self> {
        if resource_group.is_empty() {
            return Err(Error::validation_for_field(
                "azure client",
                "resourceGroup",
                "resource group is required",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("azure client", e.to_string()))?;

        let base_url = resource_group_url(&endpoints.management, &credentials.subscription_id, resource_group);
        Ok(Self {
            tokens: TokenProvider::new(http.clone(), credentials, endpoints.login),
            http,
            base_url,
        })
    }

    fn scale_set_url(&self, scale_set: &str, suffix: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachineScaleSets/{scale_set}{suffix}?api-version={API_VERSION}",
            self.base_url
        )
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Send a request, mapping transport and HTTP failures to cloud errors
    async fn send(&self, scale_set: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::cloud(scale_set, format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(scale_set, status, &model::error_message(&body)))
    }

    async fn get_json(&self, scale_set: &str, url: &str) -> Result<Value> {
        retry_with_backoff(&read_retry(), "azure read", move || async move {
            let request = self.request(Method::GET, url).await?;
            let response = self.send(scale_set, request).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| Error::cloud(scale_set, format!("invalid response body: {e}")))
        })
        .await
    }

    /// Issue a mutating call and return a handle to its long-running operation
    async fn mutate(
        &self,
        scale_set: &str,
        method: Method,
        url: &str,
        body: Option<Value>,
        description: String,
    ) -> Result<Operation> {
        let mut request = self.request(method, url).await?;
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = self.send(scale_set, request).await?;

        Ok(match operation_url(response.headers()) {
            Some(status_url) => {
                debug!(%scale_set, %description, "long-running operation accepted");
                Operation::pending(scale_set, description, status_url)
            }
            None => Operation::completed(scale_set, description),
        })
    }

    async fn vm_action(&self, scale_set: &str, instance_id: &str, action: &str) -> Result<Operation> {
        let url = self.scale_set_url(scale_set, &format!("/virtualMachines/{instance_id}/{action}"));
        self.mutate(scale_set, Method::POST, &url, None, format!("{action} instance {instance_id}"))
            .await
    }
}

fn resource_group_url(management: &str, subscription_id: &str, resource_group: &str) -> String {
    format!(
        "{}/subscriptions/{subscription_id}/resourceGroups/{resource_group}",
        management.trim_end_matches('/')
    )
}

fn read_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: READ_ATTEMPTS,
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    }
}

/// Throttling and server errors are worth retrying; other failures are not
fn status_error(scale_set: &str, status: StatusCode, message: &str) -> Error {
    let message = format!("{status}: {message}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::cloud(scale_set, message)
    } else {
        Error::cloud_permanent(scale_set, message)
    }
}

/// Polling URL of an accepted long-running operation
///
/// `Azure-AsyncOperation` is preferred over `Location` when both are sent.
fn operation_url(headers: &HeaderMap) -> Option<String> {
    [ASYNC_OPERATION, LOCATION.as_str()]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .next()
}

#[async_trait]
impl ScaleSetClient for AzureScaleSetClient {
    #[instrument(skip(self))]
    async fn get(&self, scale_set: &str) -> Result<ScaleSet> {
        let body = self.get_json(scale_set, &self.scale_set_url(scale_set, "")).await?;
        model::parse_scale_set(scale_set, body)
    }

    #[instrument(skip(self))]
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<VmInstance>> {
        let mut instances = Vec::new();
        let mut url = Some(self.scale_set_url(scale_set, "/virtualMachines"));
        while let Some(next) = url {
            let page = model::parse_instance_page(scale_set, self.get_json(scale_set, &next).await?)?;
            instances.extend(page.instances);
            url = page.next_link;
        }
        Ok(instances)
    }

    async fn update_model(&self, scale_set: &str, target: &TargetModel) -> Result<Operation> {
        let url = self.scale_set_url(scale_set, "");
        self.mutate(
            scale_set,
            Method::PATCH,
            &url,
            Some(model::model_patch(target)),
            "update model".to_string(),
        )
        .await
    }

    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation> {
        let url = self.scale_set_url(scale_set, "");
        self.mutate(
            scale_set,
            Method::PATCH,
            &url,
            Some(model::capacity_patch(capacity)),
            format!("set capacity to {capacity}"),
        )
        .await
    }

    async fn update_instance_model(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let url = self.scale_set_url(scale_set, "/manualupgrade");
        self.mutate(
            scale_set,
            Method::POST,
            &url,
            Some(model::instance_ids(instance_id)),
            format!("update instance {instance_id}"),
        )
        .await
    }

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        self.vm_action(scale_set, instance_id, "reimage").await
    }

    async fn deallocate(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        self.vm_action(scale_set, instance_id, "deallocate").await
    }

    async fn start(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        self.vm_action(scale_set, instance_id, "start").await
    }

    async fn delete(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let url = self.scale_set_url(scale_set, &format!("/virtualMachines/{instance_id}"));
        self.mutate(scale_set, Method::DELETE, &url, None, format!("delete instance {instance_id}"))
            .await
    }

    async fn operation_status(&self, operation: &Operation) -> Result<OperationStatus> {
        let Some(url) = &operation.status_url else {
            return Ok(OperationStatus::Succeeded);
        };
        let scale_set = operation.scale_set.as_str();
        let request = self.request(Method::GET, url).await?;
        let response = self.send(scale_set, request).await?;
        let code = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(model::parse_operation_status(code, &body))
    }
}
