//! Conversation, cost and usage types shared by every step

use crate::errors::{ErrorCategory, ErrorExt, EngineError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tool invocation proposed by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,

    /// Name of the tool to call
    pub api_name: String,

    /// Plugin or gateway identifier that owns the tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    /// Arguments to pass to the tool (JSON string)
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call
    pub fn new(
        id: impl Into<String>,
        api_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api_name: api_name.into(),
            identifier: None,
            arguments: arguments.into(),
        }
    }

    /// Parse the argument string. An empty string parses as an empty object.
    pub fn arguments_json(&self) -> Result<serde_json::Value, EngineError> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message in an operation's conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,

    pub content: String,

    /// Set on tool result messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    /// Assistant message that carries the tool calls it asked for
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(MessageRole::Assistant, content)
        }
    }

    pub fn tool_result(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Accumulated cost of an operation.
///
/// `total` only ever grows: every accrual path ignores negative and
/// non-finite amounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cost {
    pub total: f64,
    #[serde(default)]
    pub llm: f64,
    #[serde(default)]
    pub tools: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for Cost {
    fn default() -> Self {
        Self {
            total: 0.0,
            llm: 0.0,
            tools: 0.0,
            currency: default_currency(),
        }
    }
}

impl Cost {
    /// Add a model call's cost. Returns the amount actually added.
    pub fn accrue_llm(&mut self, amount: f64) -> f64 {
        let amount = sanitize(amount);
        self.llm += amount;
        self.total += amount;
        amount
    }

    /// Add a tool call's cost. Returns the amount actually added.
    pub fn accrue_tool(&mut self, amount: f64) -> f64 {
        let amount = sanitize(amount);
        self.tools += amount;
        self.total += amount;
        amount
    }
}

fn sanitize(amount: f64) -> f64 {
    if amount.is_finite() && amount > 0.0 {
        amount
    } else {
        0.0
    }
}

/// Usage counters, informational only
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub llm_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub approval_requests: u64,
    pub prompt_requests: u64,
    pub select_requests: u64,
}

/// What to do when an operation's cost passes its limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CostLimitAction {
    /// Finish the operation
    #[default]
    Stop,
    /// Keep going, emitting a warning
    Continue,
}

/// Per-operation spending cap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostLimit {
    pub max_total_cost: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub on_exceeded: CostLimitAction,
}

impl CostLimit {
    pub fn is_exceeded_by(&self, cost: &Cost) -> bool {
        cost.total >= self.max_total_cost
    }
}

/// Structured failure recorded on a state in `error`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl StepError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&EngineError> for StepError {
    fn from(err: &EngineError) -> Self {
        let kind = match err.category() {
            ErrorCategory::Business => "agent_error",
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Authentication => "authentication_error",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::System => "system_error",
        };
        Self::new(kind, err.to_string())
    }
}

/// Delivery priority requested from the scheduler
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}
