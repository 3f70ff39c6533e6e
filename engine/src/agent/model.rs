//! Model client
//!
//! The step body talks to a language model through the `ModelClient` trait.
//! `OpenAiModelClient` speaks the OpenAI-compatible chat completions API,
//! which most hosted and local providers expose.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{Message, MessageRole, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::AgentConfig;

/// A tool the model may call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// One model completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost of this call in the operation's currency
    pub cost: f64,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, EngineError>;
}

/// OpenAI-compatible chat completions client
pub struct OpenAiModelClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    input_cost_per_1k: f64,
    output_cost_per_1k: f64,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiModelClient {
    pub fn new(config: &AgentConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                "{} is not set, model calls will be sent without credentials",
                config.api_key_env
            );
        }

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            input_cost_per_1k: config.input_cost_per_1k,
            output_cost_per_1k: config.output_cost_per_1k,
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API key, for tests and embedded use
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn estimated_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k
    }

    async fn send(&self, payload: &Value) -> Result<Value, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => EngineError::Model("authentication failed".to_string()),
                429 => EngineError::Model("rate limit exceeded".to_string()),
                _ => EngineError::Model(format!("HTTP {}: {}", status, text)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Model(format!("unreadable response: {}", e)))
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, EngineError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages.iter().map(to_api_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            payload["tools"] = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
        }

        tracing::debug!(
            "Calling model {} with {} messages and {} tools",
            self.model,
            messages.len(),
            tools.len()
        );

        let data = timeout(self.timeout, self.send(&payload))
            .await
            .map_err(|_| EngineError::ModelTimeout)??;

        let mut reply = parse_reply(&data)?;
        reply.cost = self.estimated_cost(reply.input_tokens, reply.output_tokens);
        Ok(reply)
    }
}

fn to_api_message(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role.to_string(),
        "content": message.content,
    });
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    if message.role == MessageRole::Assistant && !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.api_name, "arguments": call.arguments },
                })
            })
            .collect();
    }
    value
}

fn parse_reply(data: &Value) -> Result<ModelReply, EngineError> {
    let message = data
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| EngineError::Model("No message in response".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCall::new(
                        call.get("id")?.as_str()?,
                        function.get("name")?.as_str()?,
                        function
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}"),
                    ))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let usage = data.get("usage");
    let tokens = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(|t| t.as_u64())
            .unwrap_or(0)
    };

    Ok(ModelReply {
        content,
        tool_calls,
        input_tokens: tokens("prompt_tokens"),
        output_tokens: tokens("completion_tokens"),
        cost: 0.0,
    })
}
