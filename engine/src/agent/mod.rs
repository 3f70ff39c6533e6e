//! Agent step body
//!
//! One step of an operation runs here: the `Agent` decides what to do from
//! the step's context, and the `AgentRuntime` carries the resulting
//! instructions out against the model and tool collaborators, producing the
//! next state. Nothing in this module persists anything or schedules the
//! next step; that is the executor's job.

pub mod general;
pub mod model;
pub mod runtime;
pub mod tools;

pub use general::{GeneralAgent, ASK_HUMAN_SELECT_TOOL, ASK_HUMAN_TOOL};
pub use model::{ModelClient, ModelReply, OpenAiModelClient, ToolDefinition};
pub use runtime::{AgentRuntime, StepOutcome};
pub use tools::{GatewayToolExecutor, NoTools, ToolExecutor, ToolOutcome};

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::state::{HumanPrompt, HumanSelect, StepContext, StepState};
use sdk::types::ToolCall;
use serde::Serialize;

/// Unit of work the runtime carries out for an agent
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    CallLlm,
    CallTool(ToolCall),
    CallToolsBatch(Vec<ToolCall>),
    RequestHumanApprove(Vec<ToolCall>),
    RequestHumanPrompt(HumanPrompt),
    RequestHumanSelect(HumanSelect),
    Finish { reason: String },
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::CallLlm => "call_llm",
            Instruction::CallTool(_) => "call_tool",
            Instruction::CallToolsBatch(_) => "call_tools_batch",
            Instruction::RequestHumanApprove(_) => "request_human_approve",
            Instruction::RequestHumanPrompt(_) => "request_human_prompt",
            Instruction::RequestHumanSelect(_) => "request_human_select",
            Instruction::Finish { .. } => "finish",
        }
    }
}

/// Decides the next instructions from a step's context
#[async_trait]
pub trait Agent: Send + Sync {
    async fn runner(
        &self,
        context: &StepContext,
        state: &StepState,
    ) -> Result<Vec<Instruction>, EngineError>;
}

/// Something notable that happened during a step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    LlmCompleted { tool_calls: usize, cost: f64 },
    ToolCompleted { name: String, is_error: bool, cost: f64 },
    HumanGateOpened { kind: &'static str },
    CostWarning { total: f64, limit: f64 },
    Done { reason: String },
    Error { message: String },
}

impl StepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StepEvent::LlmCompleted { .. } => "llm",
            StepEvent::ToolCompleted { .. } => "tool",
            StepEvent::HumanGateOpened { .. } => "human_gate",
            StepEvent::CostWarning { .. } => "cost_warning",
            StepEvent::Done { .. } => "done",
            StepEvent::Error { .. } => "error",
        }
    }
}
