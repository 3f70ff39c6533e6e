//! Agent runtime
//!
//! Executes exactly one step of an operation: asks the agent for
//! instructions, carries them out against the model and tools, and returns
//! the next state together with the context for the following step.
//!
//! # Limits
//!
//! - `max_steps`: the step that reaches it finishes the operation instead of
//!   asking for another
//! - cost limit: `stop` finishes the operation, `continue` records a warning
//!
//! Failures inside the body never escape: they turn into `status = error`
//! with a structured `StepError`.

use std::sync::Arc;

use sdk::errors::EngineError;
use sdk::state::{
    OperationStatus, PendingReason, StatusKind, StepContext, StepPhase, StepState,
};
use sdk::types::{CostLimitAction, Message, MessageRole, StepError, ToolCall};
use serde_json::json;
use tracing::{debug, info, warn};

use super::general::GeneralAgent;
use super::model::ModelClient;
use super::tools::{ToolExecutor, ToolOutcome};
use super::{Agent, Instruction, StepEvent};

/// Result of one step body run
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: StepState,
    pub events: Vec<StepEvent>,
    /// Context for the following step; `None` when nothing follows
    pub next_context: Option<StepContext>,
    /// Cost added during this step
    pub cost_delta: f64,
}

impl StepOutcome {
    /// Short description for the step history
    pub fn summary(&self) -> String {
        if self.events.is_empty() {
            return "no events".to_string();
        }
        self.events
            .iter()
            .map(StepEvent::name)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn produced_tool_result(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, StepEvent::ToolCompleted { .. }))
    }

    pub fn has_error_event(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, StepEvent::CostWarning { .. } | StepEvent::Error { .. }))
    }
}

const SKIPPED_TOOL_RESULT: &str = "Not executed: waiting for human input";

pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    system_prompt: Option<String>,
}

impl AgentRuntime {
    pub fn new(
        agent: Arc<dyn Agent>,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            agent,
            model,
            tools,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Run one step on behalf of `owner_user_id`
    pub async fn step(
        &self,
        owner_user_id: &str,
        mut state: StepState,
        context: StepContext,
    ) -> StepOutcome {
        let cost_before = state.cost.total;
        let mut events = Vec::new();

        state.step_count += 1;

        let next_context = if state.max_steps.is_some_and(|max| state.step_count > max) {
            info!(
                "Operation {} reached its step limit at step {}",
                state.operation_id, state.step_count
            );
            state.status = OperationStatus::Done;
            events.push(StepEvent::Done {
                reason: "max_steps_exceeded".to_string(),
            });
            None
        } else {
            if matches!(state.status, OperationStatus::Idle) {
                state.status = OperationStatus::Running;
            }

            match self
                .run_instructions(owner_user_id, &mut state, &context, &mut events)
                .await
            {
                Ok(Some(next)) if state.max_steps.is_some_and(|max| state.step_count >= max) => {
                    if state.status.kind() == StatusKind::Running {
                        info!(
                            "Operation {} used its last step ({}), finishing",
                            state.operation_id, state.step_count
                        );
                        state.status = OperationStatus::Done;
                        events.push(StepEvent::Done {
                            reason: "max_steps_exceeded".to_string(),
                        });
                        None
                    } else {
                        Some(next)
                    }
                }
                Ok(next) => next,
                Err(e) => {
                    warn!("Step body failed for {}: {}", state.operation_id, e);
                    events.push(StepEvent::Error {
                        message: e.to_string(),
                    });
                    state.status = OperationStatus::Error(StepError::from(&e));
                    None
                }
            }
        };

        state.touch();
        let cost_delta = state.cost.total - cost_before;

        StepOutcome {
            state,
            events,
            next_context,
            cost_delta,
        }
    }

    async fn run_instructions(
        &self,
        owner_user_id: &str,
        state: &mut StepState,
        context: &StepContext,
        events: &mut Vec<StepEvent>,
    ) -> Result<Option<StepContext>, EngineError> {
        let instructions = self.agent.runner(context, state).await?;
        let mut next = None;

        for instruction in instructions {
            debug!(
                "Operation {} executing {}",
                state.operation_id,
                instruction.name()
            );
            next = self.execute(owner_user_id, state, instruction, events).await?;

            if state.status.kind() != StatusKind::Running {
                break;
            }

            if let Some(limit) = &state.cost_limit {
                if limit.is_exceeded_by(&state.cost) {
                    match limit.on_exceeded {
                        CostLimitAction::Stop => {
                            info!(
                                "Operation {} stopped at cost {:.4} (limit {:.4})",
                                state.operation_id, state.cost.total, limit.max_total_cost
                            );
                            state.status = OperationStatus::Done;
                            events.push(StepEvent::Done {
                                reason: "cost_limit_exceeded".to_string(),
                            });
                            return Ok(None);
                        }
                        CostLimitAction::Continue => {
                            let warned = events
                                .iter()
                                .any(|e| matches!(e, StepEvent::CostWarning { .. }));
                            if !warned {
                                warn!(
                                    "Operation {} is over its cost limit ({:.4} >= {:.4})",
                                    state.operation_id, state.cost.total, limit.max_total_cost
                                );
                                events.push(StepEvent::CostWarning {
                                    total: state.cost.total,
                                    limit: limit.max_total_cost,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(next.map(|c| c.with_session(state)))
    }

    async fn execute(
        &self,
        owner_user_id: &str,
        state: &mut StepState,
        instruction: Instruction,
        events: &mut Vec<StepEvent>,
    ) -> Result<Option<StepContext>, EngineError> {
        match instruction {
            Instruction::CallLlm => self.call_llm(state, events).await.map(Some),

            Instruction::CallTool(call) => {
                let outcome = self.run_tool(owner_user_id, state, &call, events).await;
                Ok(Some(StepContext::new(
                    StepPhase::ToolResult,
                    tool_payload(&call, &outcome),
                )))
            }

            Instruction::CallToolsBatch(calls) => {
                let mut results = Vec::with_capacity(calls.len());
                for call in &calls {
                    let outcome = self.run_tool(owner_user_id, state, call, events).await;
                    results.push(tool_payload(call, &outcome));
                }
                Ok(Some(StepContext::new(
                    StepPhase::ToolsBatchResult,
                    json!({ "results": results }),
                )))
            }

            Instruction::RequestHumanApprove(calls) => {
                state.usage.approval_requests += 1;
                events.push(StepEvent::HumanGateOpened {
                    kind: "tool_approval",
                });
                state.status = OperationStatus::WaitingForHuman(PendingReason::ToolApproval(calls));
                Ok(None)
            }

            Instruction::RequestHumanPrompt(prompt) => {
                close_sibling_calls(state, gate_call_id(prompt.metadata.as_ref()));
                state.usage.prompt_requests += 1;
                events.push(StepEvent::HumanGateOpened {
                    kind: "human_prompt",
                });
                state.status = OperationStatus::WaitingForHuman(PendingReason::HumanPrompt(prompt));
                Ok(None)
            }

            Instruction::RequestHumanSelect(select) => {
                close_sibling_calls(state, gate_call_id(select.metadata.as_ref()));
                state.usage.select_requests += 1;
                events.push(StepEvent::HumanGateOpened {
                    kind: "human_select",
                });
                state.status = OperationStatus::WaitingForHuman(PendingReason::HumanSelect(select));
                Ok(None)
            }

            Instruction::Finish { reason } => {
                info!("Operation {} finished: {}", state.operation_id, reason);
                state.status = OperationStatus::Done;
                events.push(StepEvent::Done { reason });
                Ok(None)
            }
        }
    }

    async fn call_llm(
        &self,
        state: &mut StepState,
        events: &mut Vec<StepEvent>,
    ) -> Result<StepContext, EngineError> {
        let mut tools = self.tools.definitions().await?;
        tools.extend(GeneralAgent::human_tool_definitions());

        let reply = match &self.system_prompt {
            Some(prompt) if !state.messages.iter().any(|m| m.role == MessageRole::System) => {
                let mut messages = Vec::with_capacity(state.messages.len() + 1);
                messages.push(Message::system(prompt.clone()));
                messages.extend(state.messages.iter().cloned());
                self.model.chat(&messages, &tools).await?
            }
            _ => self.model.chat(&state.messages, &tools).await?,
        };

        let cost = state.cost.accrue_llm(reply.cost);
        state.usage.llm_calls += 1;
        state.usage.input_tokens += reply.input_tokens;
        state.usage.output_tokens += reply.output_tokens;

        debug!(
            "Model {} replied with {} tool calls (cost {:.6})",
            self.model.name(),
            reply.tool_calls.len(),
            cost
        );

        events.push(StepEvent::LlmCompleted {
            tool_calls: reply.tool_calls.len(),
            cost,
        });

        let payload = json!({
            "content": reply.content,
            "toolCalls": reply.tool_calls,
        });
        state.messages.push(Message::assistant_with_tools(
            reply.content,
            reply.tool_calls,
        ));

        Ok(StepContext::new(StepPhase::LlmResult, payload))
    }

    /// Run one tool call; failures become error results the model can see
    async fn run_tool(
        &self,
        owner_user_id: &str,
        state: &mut StepState,
        call: &ToolCall,
        events: &mut Vec<StepEvent>,
    ) -> ToolOutcome {
        let outcome = match self.tools.execute(call, owner_user_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Tool {} failed: {}", call.api_name, e);
                ToolOutcome {
                    content: format!("Error: {}", e),
                    cost: 0.0,
                    is_error: true,
                }
            }
        };

        let cost = state.cost.accrue_tool(outcome.cost);
        state.usage.tool_calls += 1;
        state
            .messages
            .push(Message::tool_result(outcome.content.clone(), call.id.clone()));
        events.push(StepEvent::ToolCompleted {
            name: call.api_name.clone(),
            is_error: outcome.is_error,
            cost,
        });

        outcome
    }
}

fn tool_payload(call: &ToolCall, outcome: &ToolOutcome) -> serde_json::Value {
    json!({
        "toolCallId": call.id,
        "apiName": call.api_name,
        "content": outcome.content,
        "isError": outcome.is_error,
    })
}

fn gate_call_id(metadata: Option<&serde_json::Value>) -> Option<String> {
    metadata
        .and_then(|m| m.get("toolCallId"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

/// Answer every other call of the last assistant message so the
/// conversation stays well-formed while the gate is open
fn close_sibling_calls(state: &mut StepState, gate_call: Option<String>) {
    let Some(assistant) = state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
    else {
        return;
    };

    let unanswered: Vec<String> = assistant
        .tool_calls
        .iter()
        .map(|c| c.id.clone())
        .filter(|id| Some(id) != gate_call.as_ref())
        .filter(|id| {
            !state
                .messages
                .iter()
                .any(|m| m.tool_call_id.as_deref() == Some(id.as_str()))
        })
        .collect();

    for id in unanswered {
        state.messages.push(Message::tool_result(SKIPPED_TOOL_RESULT, id));
    }
}
