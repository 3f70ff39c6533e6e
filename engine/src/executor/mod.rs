//! Step executor
//!
//! Runs one delivery of a step request end to end:
//!
//! 1. Serialize on the operation (`OperationLocks`)
//! 2. Load the state and drop deliveries that are cancelled, terminal,
//!    duplicated, out of order, or still gated
//! 3. Resolve a pending human gate with the request's decision
//! 4. Run the step body
//! 5. Commit the new state with a compare-and-swap on `step_count`
//! 6. Hand the next step to the continuation scheduler
//!
//! A step that committed but could not schedule its continuation reports
//! `success = false`. The continuation stays on the state row, and the
//! scheduler's redelivery of the same step retries the scheduling instead of
//! re-running the step.

pub mod gate;
pub mod lock;

pub use lock::OperationLocks;

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::handles::ExecutorHandleImpl;
use sdk::state::{StatusKind, StepContext, StepState};
use sdk::step::{OperationMetadata, StepRequest, StepResult};
use sdk::types::{CostLimitAction, Priority};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{AgentRuntime, StepOutcome};
use crate::db::{Database, HistoryRecord, OperationRepository, StateRepository, StoredState};
use crate::scheduler::{ContinuationScheduler, ScheduledStep};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
const TOOL_RESULT_EXTRA_DELAY: Duration = Duration::from_millis(50);
const MAX_ERROR_DELAY: Duration = Duration::from_millis(1000);

/// Step result together with the context the next step should run with
#[derive(Debug, Clone)]
pub struct StepRun {
    pub result: StepResult,
    pub next_context: Option<StepContext>,
}

pub struct StepExecutor {
    operations: OperationRepository,
    states: StateRepository,
    runtime: Arc<AgentRuntime>,
    scheduler: Option<Arc<dyn ContinuationScheduler>>,
    locks: OperationLocks,
    endpoint: String,
    base_delay: Duration,
}

impl StepExecutor {
    pub fn new(
        db: &Database,
        runtime: Arc<AgentRuntime>,
        scheduler: Option<Arc<dyn ContinuationScheduler>>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            operations: db.operations(),
            states: db.states(),
            runtime,
            scheduler,
            locks: OperationLocks::new(),
            endpoint: endpoint.into(),
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn operations(&self) -> &OperationRepository {
        &self.operations
    }

    pub fn states(&self) -> &StateRepository {
        &self.states
    }

    pub fn locks(&self) -> &OperationLocks {
        &self.locks
    }

    /// Hand a step request to the scheduler
    ///
    /// Returns `None` when scheduling is disabled.
    pub async fn schedule(
        &self,
        request: StepRequest,
        delay: Duration,
        priority: Priority,
    ) -> Result<Option<String>, EngineError> {
        let Some(scheduler) = &self.scheduler else {
            debug!(
                "Scheduling disabled, not delivering step {} of {}",
                request.step_index, request.operation_id
            );
            return Ok(None);
        };

        scheduler
            .schedule(ScheduledStep {
                endpoint: self.endpoint.clone(),
                request,
                delay,
                priority,
            })
            .await
            .map(Some)
    }

    /// Execute one delivery and schedule its continuation
    pub async fn execute_step(
        &self,
        owner_user_id: &str,
        request: StepRequest,
    ) -> Result<StepResult, EngineError> {
        self.run(owner_user_id, request, true)
            .await
            .map(|run| run.result)
    }

    /// Execute one delivery; continuations are only scheduled when
    /// `schedule` is set
    pub async fn run(
        &self,
        owner_user_id: &str,
        request: StepRequest,
        schedule: bool,
    ) -> Result<StepRun, EngineError> {
        let span = info_span!(
            "step",
            operation_id = %request.operation_id,
            step_index = request.step_index
        );

        self.run_locked(owner_user_id, request, schedule)
            .instrument(span)
            .await
    }

    async fn run_locked(
        &self,
        owner_user_id: &str,
        request: StepRequest,
        schedule: bool,
    ) -> Result<StepRun, EngineError> {
        let started = Instant::now();
        let _guard = self.locks.acquire(&request.operation_id).await;

        let StoredState {
            mut state,
            pending_continuation,
        } = self
            .states
            .load(&request.operation_id)
            .await?
            .ok_or_else(|| EngineError::StateNotFound(request.operation_id.clone()))?;

        if state.is_terminal() {
            debug!("Operation is {}, ignoring delivery", state.status.kind());
            return Ok(no_op(state));
        }

        if request.step_index != state.step_count {
            let redelivered = state.step_count.checked_sub(1) == Some(request.step_index);
            if redelivered && schedule && !request.has_intervention() {
                if let Some(context) = pending_continuation {
                    info!("Retrying continuation of an already committed step");
                    let mut result = StepResult::no_op(state);
                    self.continue_with(&mut result, context, self.base_delay).await;
                    return Ok(StepRun {
                        result,
                        next_context: None,
                    });
                }
            }

            warn!(
                "Ignoring step {}: operation is at step {}",
                request.step_index, state.step_count
            );
            return Ok(no_op(state));
        }

        let context = if state.is_waiting_for_human() {
            if !request.has_intervention() {
                debug!("Still waiting for a human decision");
                return Ok(no_op(state));
            }
            gate::resolve(&mut state, &request)?
        } else {
            if request.has_intervention() {
                return Err(EngineError::Validation(
                    "operation is not waiting for a human decision".to_string(),
                ));
            }
            request
                .context
                .clone()
                .or(pending_continuation)
                .or_else(|| {
                    state
                        .initial_context
                        .clone()
                        .filter(|_| state.step_count == 0)
                })
                .unwrap_or_else(|| StepContext::initial(&state))
        };

        let expected_step_count = state.step_count;
        let outcome = self.runtime.step(owner_user_id, state, context).await;

        let next_context = outcome
            .next_context
            .clone()
            .filter(|_| should_continue(&outcome.state, outcome.next_context.as_ref()));

        let history = HistoryRecord {
            step_index: request.step_index,
            cost_delta: outcome.cost_delta,
            execution_time_ms: started.elapsed().as_millis() as u64,
            summary: outcome.summary(),
        };

        match self
            .states
            .commit_step(expected_step_count, &outcome.state, next_context.as_ref(), &history)
            .await
        {
            Ok(()) => {}
            Err(EngineError::StateConflict { .. }) => {
                warn!("Another delivery committed first, discarding this step");
                let current = self
                    .states
                    .load(&request.operation_id)
                    .await?
                    .ok_or_else(|| EngineError::StateNotFound(request.operation_id.clone()))?;
                return Ok(no_op(current.state));
            }
            Err(e) => return Err(e),
        }

        info!(
            "Step committed: status={} step_count={} total_cost={:.6}",
            outcome.state.status.kind(),
            outcome.state.step_count,
            outcome.state.cost.total
        );

        let delay = step_delay(&outcome, self.base_delay);
        let mut result = StepResult {
            state: outcome.state,
            success: true,
            next_step_scheduled: false,
            duplicate: false,
            message_id: None,
            schedule_error: None,
        };

        if schedule {
            if let Some(context) = next_context.clone() {
                self.continue_with(&mut result, context, delay).await;
            }
        }

        Ok(StepRun {
            result,
            next_context,
        })
    }

    /// Schedule the step after `result.state` and record the outcome
    async fn continue_with(&self, result: &mut StepResult, context: StepContext, delay: Duration) {
        let operation_id = result.state.operation_id.clone();
        let step_count = result.state.step_count;
        let request = StepRequest::new(operation_id.clone(), step_count).with_context(context);

        match self
            .schedule(request, delay, step_priority(&result.state))
            .await
        {
            Ok(Some(message_id)) => {
                if let Err(e) = self
                    .states
                    .mark_continuation_scheduled(&operation_id, step_count)
                    .await
                {
                    warn!("Failed to clear scheduled continuation: {}", e);
                }
                result.next_step_scheduled = true;
                result.message_id = Some(message_id);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to schedule step {}: {}", step_count, e);
                result.success = false;
                result.schedule_error = Some(e.to_string());
            }
        }
    }
}

fn no_op(state: StepState) -> StepRun {
    StepRun {
        result: StepResult::no_op(state),
        next_context: None,
    }
}

/// Whether another step should follow `state`
pub fn should_continue(state: &StepState, next_context: Option<&StepContext>) -> bool {
    match state.status.kind() {
        StatusKind::Done | StatusKind::WaitingForHuman | StatusKind::Error | StatusKind::Cancelled => {
            return false
        }
        StatusKind::Idle | StatusKind::Running => {}
    }

    if state.max_steps.is_some_and(|max| state.step_count >= max) {
        return false;
    }

    if let Some(limit) = &state.cost_limit {
        if limit.is_exceeded_by(&state.cost) && limit.on_exceeded != CostLimitAction::Continue {
            return false;
        }
    }

    next_context.is_some()
}

/// Delay before the next step
pub fn step_delay(outcome: &StepOutcome, base: Duration) -> Duration {
    if outcome.produced_tool_result() {
        base + TOOL_RESULT_EXTRA_DELAY
    } else if outcome.has_error_event() {
        (base * 2).min(MAX_ERROR_DELAY)
    } else {
        base
    }
}

pub fn step_priority(state: &StepState) -> Priority {
    if state.is_waiting_for_human() {
        Priority::High
    } else {
        Priority::Normal
    }
}

#[async_trait]
impl ExecutorHandleImpl for StepExecutor {
    async fn metadata(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationMetadata>, EngineError> {
        self.operations.get(operation_id).await
    }

    async fn execute_step(
        &self,
        owner_user_id: &str,
        request: StepRequest,
    ) -> Result<StepResult, EngineError> {
        StepExecutor::execute_step(self, owner_user_id, request).await
    }
}
