//! Step request/result types exchanged with the executor

use crate::state::{StepContext, StepState};
use crate::types::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Human decision on a pending tool approval.
///
/// `true` approves every pending call, `false` rejects them, and a tool-call
/// object approves that call only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ApprovalDecision {
    Flag(bool),
    Call(ToolCall),
}

/// Input to one invocation of the step executor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub operation_id: String,

    /// The step the caller believes is next
    #[serde(default)]
    pub step_index: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StepContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_input: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_tool_call: Option<ApprovalDecision>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    /// Answer to a pending selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<String>>,
}

impl StepRequest {
    pub fn new(operation_id: impl Into<String>, step_index: u64) -> Self {
        Self {
            operation_id: operation_id.into(),
            step_index,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: StepContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Whether the request carries any human decision
    pub fn has_intervention(&self) -> bool {
        self.human_input.is_some()
            || self.approved_tool_call.is_some()
            || self.rejection_reason.is_some()
            || self.selection.is_some()
    }

    /// Name of the decision fields the caller supplied, for error messages
    pub fn supplied_kind(&self) -> &'static str {
        let approval = self.approved_tool_call.is_some() || self.rejection_reason.is_some();
        let kinds = [approval, self.selection.is_some(), self.human_input.is_some()];
        if kinds.iter().filter(|supplied| **supplied).count() > 1 {
            "more than one kind of decision"
        } else if approval {
            "a tool approval decision"
        } else if self.selection.is_some() {
            "a selection"
        } else if self.human_input.is_some() {
            "free-text input"
        } else {
            "nothing"
        }
    }
}

/// Output of one invocation of the step executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub state: StepState,

    pub success: bool,

    /// Whether `stepIndex + 1` was handed to the scheduler
    pub next_step_scheduled: bool,

    /// Set when the delivery was a no-op (duplicate, out of order, terminal,
    /// or still gated)
    #[serde(default)]
    pub duplicate: bool,

    /// Scheduler receipt for the continuation, when one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Why scheduling the continuation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_error: Option<String>,
}

impl StepResult {
    /// Result for a delivery that did no work
    pub fn no_op(state: StepState) -> Self {
        Self {
            state,
            success: true,
            next_step_scheduled: false,
            duplicate: true,
            message_id: None,
            schedule_error: None,
        }
    }
}

/// Immutable ownership record written once when an operation is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    pub operation_id: String,
    pub owner_user_id: String,
    pub created_at: DateTime<Utc>,
}
