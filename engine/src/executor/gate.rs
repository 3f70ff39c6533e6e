//! Human-in-the-loop gate
//!
//! Applies a human decision to a waiting state and produces the context the
//! resumed step runs with. A decision of the wrong kind is refused before
//! anything is touched, so the state stays waiting and `step_count` does not
//! move.

use sdk::errors::EngineError;
use sdk::state::{OperationStatus, PendingReason, StepContext, StepPhase, StepState};
use sdk::step::{ApprovalDecision, StepRequest};
use sdk::types::{Message, ToolCall};
use serde_json::json;
use tracing::info;

const DEFAULT_REJECTION: &str = "Rejected by user";

/// Resolve the pending gate of `state` with the decision in `request`
///
/// On success the state is `Running` again with the decision recorded in its
/// messages.
pub fn resolve(state: &mut StepState, request: &StepRequest) -> Result<StepContext, EngineError> {
    let Some(pending) = state.pending().cloned() else {
        return Err(EngineError::Validation(
            "no human decision is pending for this operation".to_string(),
        ));
    };

    let context = match &pending {
        PendingReason::ToolApproval(calls) => resolve_approval(state, request, &pending, calls)?,
        PendingReason::HumanPrompt(prompt) => {
            let input = match (&request.human_input, approval_supplied(request), &request.selection) {
                (Some(input), false, None) => input.clone(),
                _ => return Err(mismatch(&pending, request)),
            };
            state
                .messages
                .push(answer_message(input.clone(), prompt.metadata.as_ref()));
            StepContext::new(StepPhase::HumanInput, json!({ "input": input }))
        }
        PendingReason::HumanSelect(select) => {
            let values = match (&request.selection, approval_supplied(request), &request.human_input) {
                (Some(values), false, None) => values.clone(),
                _ => return Err(mismatch(&pending, request)),
            };

            if values.is_empty() {
                return Err(EngineError::Validation("selection is empty".to_string()));
            }
            if !select.multi && values.len() > 1 {
                return Err(EngineError::Validation(
                    "only one option may be selected".to_string(),
                ));
            }
            if let Some(unknown) = values
                .iter()
                .find(|v| !select.options.iter().any(|o| &o.value == *v))
            {
                return Err(EngineError::Validation(format!(
                    "'{}' is not one of the offered options",
                    unknown
                )));
            }

            state
                .messages
                .push(answer_message(values.join(", "), select.metadata.as_ref()));
            StepContext::new(StepPhase::HumanSelect, json!({ "selection": values }))
        }
    };

    info!(
        "Operation {} resumed after {}",
        state.operation_id,
        pending.intervention_type()
    );
    state.status = OperationStatus::Running;
    Ok(context.with_session(state))
}

fn approval_supplied(request: &StepRequest) -> bool {
    request.approved_tool_call.is_some() || request.rejection_reason.is_some()
}

fn mismatch(pending: &PendingReason, request: &StepRequest) -> EngineError {
    EngineError::HumanInputMismatch {
        expected: pending.expects(),
        supplied: request.supplied_kind(),
    }
}

fn resolve_approval(
    state: &mut StepState,
    request: &StepRequest,
    pending: &PendingReason,
    calls: &[ToolCall],
) -> Result<StepContext, EngineError> {
    if !approval_supplied(request) || request.selection.is_some() || request.human_input.is_some()
    {
        return Err(mismatch(pending, request));
    }

    let reject_all = request.rejection_reason.is_some()
        || matches!(request.approved_tool_call, Some(ApprovalDecision::Flag(false)));

    if reject_all {
        let reason = request
            .rejection_reason
            .clone()
            .unwrap_or_else(|| DEFAULT_REJECTION.to_string());
        let rejected = reject_calls(state, calls.iter(), &reason);
        return Ok(StepContext::new(
            StepPhase::HumanRejectedTool,
            json!({ "rejectedToolCalls": rejected, "reason": reason }),
        ));
    }

    let approved: Vec<ToolCall> = match &request.approved_tool_call {
        Some(ApprovalDecision::Call(chosen)) => {
            let Some(call) = calls.iter().find(|c| c.id == chosen.id) else {
                return Err(EngineError::Validation(format!(
                    "tool call '{}' is not pending approval",
                    chosen.id
                )));
            };
            reject_calls(
                state,
                calls.iter().filter(|c| c.id != call.id),
                "Not approved",
            );
            vec![call.clone()]
        }
        _ => calls.to_vec(),
    };

    Ok(StepContext::new(
        StepPhase::HumanApprovedTool,
        json!({ "approvedToolCalls": approved }),
    ))
}

/// Record calls as rejected and answer them so the model sees the outcome
fn reject_calls<'a>(
    state: &mut StepState,
    calls: impl Iterator<Item = &'a ToolCall>,
    reason: &str,
) -> Vec<String> {
    let mut ids = Vec::new();
    for call in calls {
        state.messages.push(Message::tool_result(
            format!("Tool call rejected: {}", reason),
            call.id.clone(),
        ));
        if !state.rejected_tool_calls.contains(&call.id) {
            state.rejected_tool_calls.push(call.id.clone());
        }
        ids.push(call.id.clone());
    }
    ids
}

/// Answer to a prompt or selection, attached to the originating tool call
/// when there is one
fn answer_message(content: String, metadata: Option<&serde_json::Value>) -> Message {
    match metadata
        .and_then(|m| m.get("toolCallId"))
        .and_then(|id| id.as_str())
    {
        Some(id) => Message::tool_result(content, id),
        None => Message::user(content),
    }
}
