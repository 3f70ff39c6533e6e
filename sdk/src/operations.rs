//! Operation management types
//!
//! Inputs and reports of the operation service: creating an operation,
//! querying its progress, listing open human gates, and resolving them.

use crate::state::{HumanPrompt, HumanSelect, PendingReason, StatusKind, StepContext, StepState};
use crate::types::{CostLimit, Message, Priority, StepError, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Parameters for creating an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOperationParams {
    pub operation_id: String,
    pub owner_user_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub cost_limit: Option<CostLimit>,
    #[serde(default)]
    pub initial_context: Option<StepContext>,
    /// Schedule step 0 right away
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOperationResult {
    pub operation_id: String,
    pub auto_started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// One committed step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepHistoryEntry {
    pub step_index: u64,
    pub status: StatusKind,
    pub cost_delta: f64,
    pub total_cost: f64,
    pub execution_time_ms: u64,
    /// Short summary of what the step did
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub total_cost: f64,
    pub total_steps: u64,
    pub total_messages: usize,
    pub uptime_ms: i64,
}

/// Progress report for a single operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatusReport {
    pub operation_id: String,
    pub owner_user_id: String,
    pub status: StatusKind,
    pub step_count: u64,
    pub is_active: bool,
    pub is_completed: bool,
    pub has_error: bool,
    pub needs_human_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingIntervention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub stats: OperationStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<StepHistoryEntry>>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// An open human gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingIntervention {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub intervention_type: String,
    pub step_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tools_calling: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_human_prompt: Option<HumanPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_human_select: Option<HumanSelect>,
    pub last_modified: DateTime<Utc>,
}

impl PendingIntervention {
    /// Describe the gate `state` is waiting on, if any
    pub fn from_state(state: &StepState) -> Option<Self> {
        let reason = state.pending()?;
        let mut pending = Self {
            operation_id: state.operation_id.clone(),
            intervention_type: reason.intervention_type().to_string(),
            step_count: state.step_count,
            pending_tools_calling: None,
            pending_human_prompt: None,
            pending_human_select: None,
            last_modified: state.last_modified,
        };
        match reason {
            PendingReason::ToolApproval(calls) => pending.pending_tools_calling = Some(calls.clone()),
            PendingReason::HumanPrompt(prompt) => pending.pending_human_prompt = Some(prompt.clone()),
            PendingReason::HumanSelect(select) => pending.pending_human_select = Some(select.clone()),
        }
        Some(pending)
    }
}

/// Filter for listing pending interventions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionFilter {
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInterventionsReport {
    pub total_count: usize,
    pub interventions: Vec<PendingIntervention>,
    pub timestamp: DateTime<Utc>,
}

/// Parameters for starting or resuming execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionParams {
    #[serde(default)]
    pub context: Option<StepContext>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// A human decision submitted through the management surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterventionAction {
    /// Approve all pending calls, or only `tool_call` when given
    Approve {
        #[serde(default, rename = "toolCall")]
        tool_call: Option<ToolCall>,
    },
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    Input {
        text: String,
    },
    Select {
        values: Vec<String>,
    },
}

/// Receipt for a step handed to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReceipt {
    pub operation_id: String,
    pub step_index: u64,
    pub scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub operation_id: String,
    pub previous_status: StatusKind,
    /// False when the operation had already finished
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OperationStatus;
    use serde_json::json;

    #[test]
    fn test_create_params_auto_start_default() {
        let params: CreateOperationParams = serde_json::from_value(json!({
            "operationId": "op-1",
            "ownerUserId": "user-1",
            "messages": [{ "role": "user", "content": "hi" }]
        }))
        .unwrap();
        assert!(params.auto_start);
        assert_eq!(params.messages.len(), 1);
    }

    #[test]
    fn test_intervention_action_tagging() {
        let action: InterventionAction =
            serde_json::from_value(json!({ "action": "reject", "reason": "unsafe" })).unwrap();
        assert_eq!(
            action,
            InterventionAction::Reject {
                reason: Some("unsafe".to_string())
            }
        );

        let action: InterventionAction =
            serde_json::from_value(json!({ "action": "select", "values": ["a", "b"] })).unwrap();
        assert!(matches!(action, InterventionAction::Select { values } if values.len() == 2));
    }

    #[test]
    fn test_pending_intervention_from_state() {
        let mut state = StepState::new("op-1", vec![]);
        assert!(PendingIntervention::from_state(&state).is_none());

        state.status = OperationStatus::WaitingForHuman(PendingReason::HumanPrompt(HumanPrompt {
            prompt: "Which branch?".to_string(),
            metadata: None,
        }));
        let pending = PendingIntervention::from_state(&state).unwrap();
        assert_eq!(pending.intervention_type, "human_prompt");
        assert!(pending.pending_human_prompt.is_some());
        assert!(pending.pending_tools_calling.is_none());
    }
}
