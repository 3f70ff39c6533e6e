//! Tool execution
//!
//! Tools run outside the engine. `GatewayToolExecutor` forwards calls to an
//! HTTP plugin gateway:
//!
//! - `GET  <gateway>/tools`  returns the tool definitions offered to the model
//! - `POST <gateway>/invoke` runs one call and returns `{content, cost?, isError?}`

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ToolCall;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;

use super::model::ToolDefinition;

/// Result of one tool call
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub cost: f64,
    /// The tool ran but reported a failure the model should see
    #[serde(default)]
    pub is_error: bool,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools offered to the model
    async fn definitions(&self) -> Result<Vec<ToolDefinition>, EngineError>;

    /// Run one call on behalf of `owner_user_id`
    async fn execute(&self, call: &ToolCall, owner_user_id: &str)
        -> Result<ToolOutcome, EngineError>;
}

/// Executor with no tools at all
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn definitions(&self) -> Result<Vec<ToolDefinition>, EngineError> {
        Ok(Vec::new())
    }

    async fn execute(
        &self,
        call: &ToolCall,
        _owner_user_id: &str,
    ) -> Result<ToolOutcome, EngineError> {
        Err(EngineError::ToolNotFound(call.api_name.clone()))
    }
}

/// Tool executor backed by an HTTP gateway
pub struct GatewayToolExecutor {
    base_url: String,
    client: reqwest::Client,
    definitions: OnceCell<Vec<ToolDefinition>>,
}

impl GatewayToolExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            definitions: OnceCell::new(),
        }
    }

    async fn fetch_definitions(&self) -> Result<Vec<ToolDefinition>, EngineError> {
        let url = format!("{}/tools", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::ToolError(format!(
                "gateway returned {} for tool listing",
                response.status()
            )));
        }

        let definitions: Vec<ToolDefinition> = response
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("unreadable tool listing: {}", e)))?;

        tracing::info!("Loaded {} tool definitions from gateway", definitions.len());
        Ok(definitions)
    }
}

#[async_trait]
impl ToolExecutor for GatewayToolExecutor {
    async fn definitions(&self) -> Result<Vec<ToolDefinition>, EngineError> {
        self.definitions
            .get_or_try_init(|| self.fetch_definitions())
            .await
            .cloned()
    }

    async fn execute(
        &self,
        call: &ToolCall,
        owner_user_id: &str,
    ) -> Result<ToolOutcome, EngineError> {
        let url = format!("{}/invoke", self.base_url);
        let payload = json!({
            "id": call.id,
            "apiName": call.api_name,
            "identifier": call.identifier,
            "arguments": call.arguments,
            "userId": owner_user_id,
        });

        tracing::debug!("Invoking tool {} ({})", call.api_name, call.id);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => response
                .json()
                .await
                .map_err(|e| EngineError::ToolError(format!("unreadable tool result: {}", e))),
            404 => Err(EngineError::ToolNotFound(call.api_name.clone())),
            _ => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                Err(EngineError::ToolError(format!(
                    "{} failed with {}: {}",
                    call.api_name, status, text
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_no_tools() {
        let tools = NoTools;
        assert!(tools.definitions().await.unwrap().is_empty());
        let err = tools
            .execute(&ToolCall::new("c", "search", "{}"), "u")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_gateway_definitions_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "name": "search", "description": "Web search" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = GatewayToolExecutor::new(server.uri());
        assert_eq!(gateway.definitions().await.unwrap()[0].name, "search");
        assert_eq!(gateway.definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_invoke() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(body_partial_json(json!({ "apiName": "search", "userId": "user-1" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "content": "3 results", "cost": 0.01 })),
            )
            .mount(&server)
            .await;

        let gateway = GatewayToolExecutor::new(server.uri());
        let outcome = gateway
            .execute(&ToolCall::new("call_1", "search", "{}"), "user-1")
            .await
            .unwrap();
        assert_eq!(outcome.content, "3 results");
        assert_eq!(outcome.cost, 0.01);
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn test_gateway_unknown_tool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let gateway = GatewayToolExecutor::new(server.uri());
        let err = gateway
            .execute(&ToolCall::new("call_1", "nope", "{}"), "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolNotFound(name) if name == "nope"));
    }
}
