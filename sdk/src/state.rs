//! Operation state machine shape
//!
//! `StepState` is the durable snapshot replaced wholesale after every step.
//! In memory the pending human gate lives inside
//! `OperationStatus::WaitingForHuman`, so a state can never carry a pending
//! reason while running, nor two pending reasons at once. On the wire the
//! state flattens back to `status` plus the three optional `pending*`
//! fields, and deserialization rejects any combination that breaks the
//! invariant.

use crate::types::{Cost, CostLimit, Message, StepError, ToolCall, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-text question awaiting a human answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanPrompt {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

/// Enumerated choice awaiting a human pick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanSelect {
    pub prompt: String,
    pub options: Vec<SelectOption>,
    #[serde(default)]
    pub multi: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Why an operation is suspended
#[derive(Debug, Clone, PartialEq)]
pub enum PendingReason {
    /// Tool calls waiting for a yes/no decision
    ToolApproval(Vec<ToolCall>),
    /// A free-text answer is needed
    HumanPrompt(HumanPrompt),
    /// The human must pick among options
    HumanSelect(HumanSelect),
}

impl PendingReason {
    /// Human readable name of the input this gate accepts
    pub fn expects(&self) -> &'static str {
        match self {
            PendingReason::ToolApproval(_) => "a tool approval decision",
            PendingReason::HumanPrompt(_) => "free-text input",
            PendingReason::HumanSelect(_) => "a selection",
        }
    }

    /// Intervention type reported by the pending-interventions listing
    pub fn intervention_type(&self) -> &'static str {
        match self {
            PendingReason::ToolApproval(_) => "tool_approval",
            PendingReason::HumanPrompt(_) => "human_prompt",
            PendingReason::HumanSelect(_) => "human_select",
        }
    }
}

/// Fieldless status, as it appears on the wire and in the status column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Idle,
    Running,
    WaitingForHuman,
    Done,
    Error,
    Cancelled,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Idle => "idle",
            StatusKind::Running => "running",
            StatusKind::WaitingForHuman => "waiting_for_human",
            StatusKind::Done => "done",
            StatusKind::Error => "error",
            StatusKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(StatusKind::Idle),
            "running" => Some(StatusKind::Running),
            "waiting_for_human" => Some(StatusKind::WaitingForHuman),
            "done" => Some(StatusKind::Done),
            "error" => Some(StatusKind::Error),
            "cancelled" => Some(StatusKind::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never execute another step
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusKind::Done | StatusKind::Error | StatusKind::Cancelled
        )
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation status with the data each state carries
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    /// Created, no step executed yet
    Idle,
    Running,
    WaitingForHuman(PendingReason),
    Done,
    Error(StepError),
    Cancelled,
}

impl OperationStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            OperationStatus::Idle => StatusKind::Idle,
            OperationStatus::Running => StatusKind::Running,
            OperationStatus::WaitingForHuman(_) => StatusKind::WaitingForHuman,
            OperationStatus::Done => StatusKind::Done,
            OperationStatus::Error(_) => StatusKind::Error,
            OperationStatus::Cancelled => StatusKind::Cancelled,
        }
    }

    pub fn pending(&self) -> Option<&PendingReason> {
        match self {
            OperationStatus::WaitingForHuman(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StepError> {
        match self {
            OperationStatus::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// Phase of the step about to run, decides what the agent does next
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Init,
    UserInput,
    LlmResult,
    ToolResult,
    ToolsBatchResult,
    HumanApprovedTool,
    HumanRejectedTool,
    HumanInput,
    HumanSelect,
    Error,
}

/// Snapshot of the operation attached to a context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub operation_id: String,
    pub step_count: u64,
    pub message_count: usize,
    pub status: StatusKind,
}

/// Continuation data handed from one step to the next
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    pub phase: StepPhase,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

impl StepContext {
    pub fn new(phase: StepPhase, payload: serde_json::Value) -> Self {
        Self {
            phase,
            payload,
            session: None,
        }
    }

    /// Attach a session snapshot of `state`
    pub fn with_session(mut self, state: &StepState) -> Self {
        self.session = Some(SessionInfo {
            operation_id: state.operation_id.clone(),
            step_count: state.step_count,
            message_count: state.messages.len(),
            status: state.status.kind(),
        });
        self
    }

    /// Context for the first step, derived from the conversation
    pub fn initial(state: &StepState) -> Self {
        let context = match state.messages.last() {
            Some(last) if last.role == crate::types::MessageRole::User => StepContext::new(
                StepPhase::UserInput,
                serde_json::json!({
                    "isFirstMessage": state.messages.len() == 1,
                    "message": last.content,
                }),
            ),
            _ => StepContext::new(StepPhase::Init, serde_json::Value::Null),
        };
        context.with_session(state)
    }
}

/// Durable snapshot of an operation's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StepStateWire", try_from = "StepStateWire")]
pub struct StepState {
    pub operation_id: String,
    pub status: OperationStatus,
    /// Executed steps; also the index of the next step to run
    pub step_count: u64,
    pub cost: Cost,
    pub usage: Usage,
    pub messages: Vec<Message>,
    pub max_steps: Option<u64>,
    pub cost_limit: Option<CostLimit>,
    pub initial_context: Option<StepContext>,
    /// Tool call ids a human denied; never proposed again
    pub rejected_tool_calls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl StepState {
    /// Fresh idle state for a new operation
    pub fn new(operation_id: impl Into<String>, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.into(),
            status: OperationStatus::Idle,
            step_count: 0,
            cost: Cost::default(),
            usage: Usage::default(),
            messages,
            max_steps: None,
            cost_limit: None,
            initial_context: None,
            rejected_tool_calls: Vec::new(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn pending(&self) -> Option<&PendingReason> {
        self.status.pending()
    }

    pub fn is_waiting_for_human(&self) -> bool {
        self.status.kind() == StatusKind::WaitingForHuman
    }

    pub fn is_terminal(&self) -> bool {
        self.status.kind().is_terminal()
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepStateWire {
    operation_id: String,
    status: StatusKind,
    step_count: u64,
    #[serde(default)]
    cost: Cost,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cost_limit: Option<CostLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial_context: Option<StepContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rejected_tool_calls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_tools_calling: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_human_prompt: Option<HumanPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_human_select: Option<HumanSelect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<StepError>,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl From<StepState> for StepStateWire {
    fn from(state: StepState) -> Self {
        let kind = state.status.kind();
        let (mut tools, mut prompt, mut select, mut error) = (None, None, None, None);
        match state.status {
            OperationStatus::WaitingForHuman(PendingReason::ToolApproval(calls)) => {
                tools = Some(calls)
            }
            OperationStatus::WaitingForHuman(PendingReason::HumanPrompt(p)) => prompt = Some(p),
            OperationStatus::WaitingForHuman(PendingReason::HumanSelect(s)) => select = Some(s),
            OperationStatus::Error(err) => error = Some(err),
            _ => {}
        }

        Self {
            operation_id: state.operation_id,
            status: kind,
            step_count: state.step_count,
            cost: state.cost,
            usage: state.usage,
            messages: state.messages,
            max_steps: state.max_steps,
            cost_limit: state.cost_limit,
            initial_context: state.initial_context,
            rejected_tool_calls: state.rejected_tool_calls,
            pending_tools_calling: tools,
            pending_human_prompt: prompt,
            pending_human_select: select,
            error,
            created_at: state.created_at,
            last_modified: state.last_modified,
        }
    }
}

impl TryFrom<StepStateWire> for StepState {
    type Error = String;

    fn try_from(wire: StepStateWire) -> Result<Self, Self::Error> {
        let pending_count = usize::from(wire.pending_tools_calling.is_some())
            + usize::from(wire.pending_human_prompt.is_some())
            + usize::from(wire.pending_human_select.is_some());

        let status = match wire.status {
            StatusKind::WaitingForHuman => {
                if pending_count != 1 {
                    return Err(format!(
                        "waiting_for_human requires exactly one pending reason, found {}",
                        pending_count
                    ));
                }
                let reason = if let Some(calls) = wire.pending_tools_calling {
                    PendingReason::ToolApproval(calls)
                } else if let Some(prompt) = wire.pending_human_prompt {
                    PendingReason::HumanPrompt(prompt)
                } else if let Some(select) = wire.pending_human_select {
                    PendingReason::HumanSelect(select)
                } else {
                    return Err("pending reason vanished".to_string());
                };
                OperationStatus::WaitingForHuman(reason)
            }
            other => {
                if pending_count != 0 {
                    return Err(format!("status {} cannot carry a pending reason", other));
                }
                match other {
                    StatusKind::Idle => OperationStatus::Idle,
                    StatusKind::Running => OperationStatus::Running,
                    StatusKind::Done => OperationStatus::Done,
                    StatusKind::Cancelled => OperationStatus::Cancelled,
                    StatusKind::Error => OperationStatus::Error(
                        wire.error
                            .unwrap_or_else(|| StepError::new("unknown", "unrecorded failure")),
                    ),
                    StatusKind::WaitingForHuman => unreachable!("handled above"),
                }
            }
        };

        Ok(Self {
            operation_id: wire.operation_id,
            status,
            step_count: wire.step_count,
            cost: wire.cost,
            usage: wire.usage,
            messages: wire.messages,
            max_steps: wire.max_steps,
            cost_limit: wire.cost_limit,
            initial_context: wire.initial_context,
            rejected_tool_calls: wire.rejected_tool_calls,
            created_at: wire.created_at,
            last_modified: wire.last_modified,
        })
    }
}
