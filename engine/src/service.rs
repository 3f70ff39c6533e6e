//! Operation service
//!
//! Management surface around the step executor: creating operations,
//! reporting progress, listing and submitting human decisions, starting,
//! cancelling, and driving an operation synchronously in-process.
//!
//! Nothing here mutates a state row except through the executor's commit
//! path or the cancellation overwrite, so the step-index idempotency check
//! keeps holding for every scheduled delivery.

use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::handles::OperationsHandleImpl;
use sdk::operations::{
    CancelResult, CreateOperationParams, CreateOperationResult, InterventionAction,
    InterventionFilter, OperationStats, OperationStatusReport, PendingIntervention,
    PendingInterventionsReport, ScheduleReceipt, StartExecutionParams,
};
use sdk::state::{OperationStatus, StatusKind, StepContext, StepPhase, StepState};
use sdk::step::{ApprovalDecision, OperationMetadata, StepRequest};
use sdk::types::{CostLimit, Priority};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::executor::{gate, should_continue, StepExecutor};

const AUTO_START_DELAY: Duration = Duration::from_millis(50);
const INTERVENTION_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_HISTORY_LIMIT: u32 = 10;
const DEFAULT_SYNC_STEP_LIMIT: u64 = 9999;

pub struct OperationService {
    executor: Arc<StepExecutor>,
    default_max_steps: Option<u64>,
    default_cost_limit: Option<CostLimit>,
}

impl OperationService {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self {
            executor,
            default_max_steps: None,
            default_cost_limit: None,
        }
    }

    /// Limits applied to new operations that do not set their own
    pub fn with_defaults(mut self, max_steps: Option<u64>, cost_limit: Option<CostLimit>) -> Self {
        self.default_max_steps = max_steps;
        self.default_cost_limit = cost_limit;
        self
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Create an operation and optionally schedule its first step
    pub async fn create_operation(
        &self,
        params: CreateOperationParams,
    ) -> Result<CreateOperationResult, EngineError> {
        if params.operation_id.trim().is_empty() {
            return Err(EngineError::Validation("operationId is required".to_string()));
        }
        if params.owner_user_id.trim().is_empty() {
            return Err(EngineError::Validation("ownerUserId is required".to_string()));
        }

        let metadata = OperationMetadata {
            operation_id: params.operation_id.clone(),
            owner_user_id: params.owner_user_id.clone(),
            created_at: Utc::now(),
        };

        let mut state = StepState::new(params.operation_id.clone(), params.messages);
        state.max_steps = params.max_steps.or(self.default_max_steps);
        state.cost_limit = params.cost_limit.or_else(|| self.default_cost_limit.clone());
        state.initial_context = params.initial_context;

        self.executor.operations().create(&metadata, &state).await?;
        info!(
            "Created operation {} for user {}",
            metadata.operation_id, metadata.owner_user_id
        );

        let mut message_id = None;
        if params.auto_start {
            let context = state
                .initial_context
                .clone()
                .unwrap_or_else(|| StepContext::initial(&state));
            let request = StepRequest::new(params.operation_id.clone(), 0).with_context(context);
            message_id = self
                .executor
                .schedule(request, AUTO_START_DELAY, Priority::High)
                .await?;
            debug!("First step of {} scheduled: {:?}", params.operation_id, message_id);
        }

        Ok(CreateOperationResult {
            operation_id: params.operation_id,
            auto_started: message_id.is_some(),
            message_id,
        })
    }

    /// Progress report; `None` for unknown operations
    pub async fn get_operation_status(
        &self,
        operation_id: &str,
        include_history: bool,
        history_limit: Option<u32>,
    ) -> Result<Option<OperationStatusReport>, EngineError> {
        let Some(metadata) = self.executor.operations().get(operation_id).await? else {
            return Ok(None);
        };
        let state = self.load_state(operation_id).await?;

        let history = if include_history {
            Some(
                self.executor
                    .states()
                    .history(operation_id, history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
                    .await?,
            )
        } else {
            None
        };

        Ok(Some(status_report(&metadata, &state, history)))
    }

    /// Operations waiting for a human decision
    pub async fn pending_interventions(
        &self,
        filter: InterventionFilter,
    ) -> Result<PendingInterventionsReport, EngineError> {
        let interventions: Vec<PendingIntervention> = match &filter.operation_id {
            Some(operation_id) => {
                let owner_matches = match (&filter.user_id, self.executor.operations().get(operation_id).await?) {
                    (_, None) => false,
                    (Some(user), Some(metadata)) => &metadata.owner_user_id == user,
                    (None, Some(_)) => true,
                };
                if owner_matches {
                    self.executor
                        .states()
                        .load(operation_id)
                        .await?
                        .and_then(|stored| PendingIntervention::from_state(&stored.state))
                        .into_iter()
                        .collect()
                } else {
                    Vec::new()
                }
            }
            None => self
                .executor
                .states()
                .list_waiting(filter.user_id.as_deref())
                .await?
                .iter()
                .filter_map(PendingIntervention::from_state)
                .collect(),
        };

        Ok(PendingInterventionsReport {
            total_count: interventions.len(),
            interventions,
            timestamp: Utc::now(),
        })
    }

    /// Schedule a step at the operation's current position
    pub async fn start_execution(
        &self,
        operation_id: &str,
        params: StartExecutionParams,
    ) -> Result<ScheduleReceipt, EngineError> {
        let state = self.load_state(operation_id).await?;

        let kind = state.status.kind();
        match kind {
            StatusKind::Idle => {}
            StatusKind::WaitingForHuman => {
                return Err(EngineError::InvalidTransition {
                    id: operation_id.to_string(),
                    reason: "it is waiting for a human decision".to_string(),
                })
            }
            StatusKind::Running | StatusKind::Done | StatusKind::Error | StatusKind::Cancelled => {
                return Err(EngineError::InvalidTransition {
                    id: operation_id.to_string(),
                    reason: format!("it is {}", kind),
                })
            }
        }

        let context = params
            .context
            .or_else(|| state.initial_context.clone().filter(|_| state.step_count == 0))
            .unwrap_or_else(|| {
                StepContext::new(StepPhase::UserInput, json!({})).with_session(&state)
            });
        let request = StepRequest::new(operation_id, state.step_count).with_context(context);
        let delay = params
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(AUTO_START_DELAY);

        let message_id = self.executor.schedule(request, delay, params.priority).await?;
        info!("Start of {} requested at step {}", operation_id, state.step_count);

        Ok(ScheduleReceipt {
            operation_id: operation_id.to_string(),
            step_index: state.step_count,
            scheduled: message_id.is_some(),
            message_id,
        })
    }

    /// Schedule a high-priority step carrying a human decision
    ///
    /// The decision is checked against the pending gate before anything is
    /// scheduled.
    pub async fn process_human_intervention(
        &self,
        operation_id: &str,
        action: InterventionAction,
    ) -> Result<ScheduleReceipt, EngineError> {
        let state = self.load_state(operation_id).await?;
        let request = intervention_request(operation_id, state.step_count, action);

        let mut probe = state.clone();
        gate::resolve(&mut probe, &request)?;

        let step_index = request.step_index;
        let message_id = self
            .executor
            .schedule(request, INTERVENTION_DELAY, Priority::High)
            .await?;
        info!(
            "Human decision for {} scheduled at step {}",
            operation_id, step_index
        );

        Ok(ScheduleReceipt {
            operation_id: operation_id.to_string(),
            step_index,
            scheduled: message_id.is_some(),
            message_id,
        })
    }

    /// Move the operation to `cancelled`; later deliveries are no-ops
    pub async fn cancel(&self, operation_id: &str) -> Result<CancelResult, EngineError> {
        let _guard = self.executor.locks().acquire(operation_id).await;
        let state = self.load_state(operation_id).await?;
        let previous_status = state.status.kind();

        if state.is_terminal() {
            debug!("Operation {} is already {}", operation_id, previous_status);
            return Ok(CancelResult {
                operation_id: operation_id.to_string(),
                previous_status,
                cancelled: false,
            });
        }

        self.executor
            .states()
            .force_status(operation_id, OperationStatus::Cancelled)
            .await?;
        info!("Cancelled operation {} (was {})", operation_id, previous_status);

        Ok(CancelResult {
            operation_id: operation_id.to_string(),
            previous_status,
            cancelled: true,
        })
    }

    /// Drive an operation in-process until it stops, waits for a human, or
    /// runs `max_steps` steps
    pub async fn execute_sync(
        &self,
        operation_id: &str,
        max_steps: Option<u64>,
    ) -> Result<StepState, EngineError> {
        let metadata = self
            .executor
            .operations()
            .get(operation_id)
            .await?
            .ok_or_else(|| EngineError::StateNotFound(operation_id.to_string()))?;

        let mut state = self.load_state(operation_id).await?;
        let mut context: Option<StepContext> = None;
        let limit = max_steps.unwrap_or(DEFAULT_SYNC_STEP_LIMIT);
        let mut executed = 0;

        info!("Running {} synchronously (limit {} steps)", operation_id, limit);

        while executed < limit {
            if state.is_terminal() || state.is_waiting_for_human() {
                break;
            }

            let mut request = StepRequest::new(operation_id, state.step_count);
            request.context = context.take();

            let run = self
                .executor
                .run(&metadata.owner_user_id, request, false)
                .await?;
            executed += 1;
            state = run.result.state;

            if run.result.duplicate {
                warn!("Synchronous run of {} was overtaken by another delivery", operation_id);
                break;
            }

            context = run.next_context;
            if !should_continue(&state, context.as_ref()) {
                break;
            }
        }

        info!(
            "Synchronous run of {} stopped at step {} with status {}",
            operation_id,
            state.step_count,
            state.status.kind()
        );
        Ok(state)
    }

    async fn load_state(&self, operation_id: &str) -> Result<StepState, EngineError> {
        self.executor
            .states()
            .load(operation_id)
            .await?
            .map(|stored| stored.state)
            .ok_or_else(|| EngineError::StateNotFound(operation_id.to_string()))
    }
}

fn intervention_request(operation_id: &str, step_index: u64, action: InterventionAction) -> StepRequest {
    let mut request = StepRequest::new(operation_id, step_index);
    match action {
        InterventionAction::Approve { tool_call } => {
            request.approved_tool_call = Some(match tool_call {
                Some(call) => ApprovalDecision::Call(call),
                None => ApprovalDecision::Flag(true),
            });
        }
        InterventionAction::Reject { reason } => {
            request.approved_tool_call = Some(ApprovalDecision::Flag(false));
            request.rejection_reason = reason;
        }
        InterventionAction::Input { text } => request.human_input = Some(text),
        InterventionAction::Select { values } => request.selection = Some(values),
    }
    request
}

fn status_report(
    metadata: &OperationMetadata,
    state: &StepState,
    history: Option<Vec<sdk::operations::StepHistoryEntry>>,
) -> OperationStatusReport {
    let status = state.status.kind();
    OperationStatusReport {
        operation_id: metadata.operation_id.clone(),
        owner_user_id: metadata.owner_user_id.clone(),
        status,
        step_count: state.step_count,
        is_active: matches!(status, StatusKind::Running | StatusKind::WaitingForHuman),
        is_completed: status == StatusKind::Done,
        has_error: status == StatusKind::Error,
        needs_human_input: status == StatusKind::WaitingForHuman,
        pending: PendingIntervention::from_state(state),
        error: state.status.error().cloned(),
        stats: OperationStats {
            total_cost: state.cost.total,
            total_steps: state.step_count,
            total_messages: state.messages.len(),
            uptime_ms: (Utc::now() - state.created_at).num_milliseconds(),
        },
        history,
        created_at: state.created_at,
        last_modified: state.last_modified,
    }
}

#[async_trait]
impl OperationsHandleImpl for OperationService {
    async fn create(
        &self,
        params: CreateOperationParams,
    ) -> Result<CreateOperationResult, EngineError> {
        self.create_operation(params).await
    }

    async fn status(
        &self,
        operation_id: &str,
        include_history: bool,
        history_limit: u32,
    ) -> Result<Option<OperationStatusReport>, EngineError> {
        self.get_operation_status(operation_id, include_history, Some(history_limit))
            .await
    }

    async fn pending(
        &self,
        filter: InterventionFilter,
    ) -> Result<PendingInterventionsReport, EngineError> {
        self.pending_interventions(filter).await
    }

    async fn start(
        &self,
        operation_id: &str,
        params: StartExecutionParams,
    ) -> Result<ScheduleReceipt, EngineError> {
        self.start_execution(operation_id, params).await
    }

    async fn intervene(
        &self,
        operation_id: &str,
        action: InterventionAction,
    ) -> Result<ScheduleReceipt, EngineError> {
        self.process_human_intervention(operation_id, action).await
    }

    async fn cancel(&self, operation_id: &str) -> Result<CancelResult, EngineError> {
        OperationService::cancel(self, operation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::ToolCall;

    #[test]
    fn test_intervention_request_mapping() {
        let approve_all = intervention_request("op", 3, InterventionAction::Approve { tool_call: None });
        assert_eq!(approve_all.step_index, 3);
        assert_eq!(approve_all.approved_tool_call, Some(ApprovalDecision::Flag(true)));

        let call = ToolCall::new("c1", "deploy", "{}");
        let approve_one = intervention_request(
            "op",
            3,
            InterventionAction::Approve {
                tool_call: Some(call.clone()),
            },
        );
        assert_eq!(approve_one.approved_tool_call, Some(ApprovalDecision::Call(call)));

        let reject = intervention_request(
            "op",
            3,
            InterventionAction::Reject {
                reason: Some("unsafe".to_string()),
            },
        );
        assert_eq!(reject.approved_tool_call, Some(ApprovalDecision::Flag(false)));
        assert_eq!(reject.rejection_reason.as_deref(), Some("unsafe"));

        let input = intervention_request("op", 3, InterventionAction::Input { text: "ok".to_string() });
        assert_eq!(input.human_input.as_deref(), Some("ok"));
        assert!(input.approved_tool_call.is_none());
    }

    #[test]
    fn test_status_report_flags() {
        let metadata = OperationMetadata {
            operation_id: "op".to_string(),
            owner_user_id: "user".to_string(),
            created_at: Utc::now(),
        };
        let mut state = StepState::new("op", vec![]);
        state.status = OperationStatus::Done;
        state.step_count = 4;

        let report = status_report(&metadata, &state, None);
        assert!(report.is_completed);
        assert!(!report.is_active);
        assert!(!report.needs_human_input);
        assert_eq!(report.stats.total_steps, 4);
        assert!(report.pending.is_none());
    }
}
