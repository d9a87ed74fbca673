use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use parley_core::ids::ApprovalId;
use parley_core::provider::ToolExecutor;
use parley_core::tools::{ToolDefinition, ToolError, ToolInvocation, ToolOutcome};

#[derive(Clone, Debug)]
pub struct ToolHubConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for ToolHubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

/// HTTP client for the tool hub.
///
/// Endpoints: `GET /mcp_hub/tools`, `POST /mcp_hub/call`,
/// `POST /mcp_hub/approve/{id}`, `POST /mcp_hub/reject/{id}`.
pub struct ToolHubClient {
    client: Client,
    config: ToolHubConfig,
}

impl ToolHubClient {
    pub fn new(config: ToolHubConfig) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ToolError::Unavailable(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Issue a request, retrying transport failures with exponential backoff.
    /// HTTP error statuses are not retried.
    async fn request_json(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ToolError> {
        let url = self.url(path);
        let mut attempt = 0;
        loop {
            let mut req = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ToolError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    return resp
                        .json()
                        .await
                        .map_err(|e| ToolError::InvalidResponse(e.to_string()));
                }
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.backoff * 2u32.pow(attempt);
                    warn!(url = %url, attempt, error = %e, "tool hub request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_timeout() => return Err(ToolError::Timeout(self.config.timeout)),
                Err(e) => return Err(ToolError::Unavailable(e.to_string())),
            }
        }
    }

    async fn outcome(&self, path: &str, body: Option<&Value>) -> Result<ToolOutcome, ToolError> {
        let value = self.request_json(Method::POST, path, body).await?;
        parse_outcome(value)
    }
}

pub(crate) fn call_payload(call: &ToolInvocation) -> Value {
    json!({
        "id": call.id,
        "type": call.kind,
        "function": {
            "name": call.name,
            "arguments": call.arguments,
        }
    })
}

pub(crate) fn parse_outcome(value: Value) -> Result<ToolOutcome, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::InvalidResponse(e.to_string()))
}

/// The hub answers either `{"tools": [...]}` or a bare list.
pub(crate) fn parse_tool_list(value: Value) -> Vec<ToolDefinition> {
    match value {
        Value::Array(tools) => tools,
        Value::Object(mut map) => match map.remove("tools") {
            Some(Value::Array(tools)) => tools,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl ToolExecutor for ToolHubClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let value = self.request_json(Method::GET, "/mcp_hub/tools", None).await?;
        Ok(parse_tool_list(value))
    }

    #[instrument(skip(self, call), fields(tool = %call.name, call_id = %call.id))]
    async fn call_tool(&self, call: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        self.outcome("/mcp_hub/call", Some(&call_payload(call))).await
    }

    #[instrument(skip(self), fields(approval_id = %approval_id))]
    async fn approve_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError> {
        self.outcome(&format!("/mcp_hub/approve/{approval_id}"), None).await
    }

    #[instrument(skip(self), fields(approval_id = %approval_id))]
    async fn reject_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError> {
        self.outcome(&format!("/mcp_hub/reject/{approval_id}"), None).await
    }
}
