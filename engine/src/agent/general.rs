//! General-purpose agent
//!
//! Maps a step's phase to instructions. The model talks to humans through two
//! reserved tools: `ask_human` opens a free-text prompt gate and
//! `ask_human_select` opens a selection gate. Tools listed in
//! `require_approval` open an approval gate before they run.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::state::{HumanPrompt, HumanSelect, SelectOption, StepContext, StepPhase, StepState};
use sdk::types::{MessageRole, ToolCall};
use serde_json::{json, Value};

use super::model::ToolDefinition;
use super::{Agent, Instruction};

pub const ASK_HUMAN_TOOL: &str = "ask_human";
pub const ASK_HUMAN_SELECT_TOOL: &str = "ask_human_select";

pub struct GeneralAgent {
    require_approval: Vec<String>,
}

impl GeneralAgent {
    pub fn new(require_approval: Vec<String>) -> Self {
        Self { require_approval }
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        if tool_name == ASK_HUMAN_TOOL || tool_name == ASK_HUMAN_SELECT_TOOL {
            return false;
        }
        self.require_approval
            .iter()
            .any(|name| name == "*" || name == tool_name)
    }

    /// Definitions of the reserved human tools
    pub fn human_tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: ASK_HUMAN_TOOL.to_string(),
                description: "Ask the user a free-text question and wait for the answer"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "prompt": { "type": "string" } },
                    "required": ["prompt"]
                }),
            },
            ToolDefinition {
                name: ASK_HUMAN_SELECT_TOOL.to_string(),
                description: "Ask the user to pick one or more of the given options".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string" },
                        "options": { "type": "array", "items": { "type": "string" } },
                        "multi": { "type": "boolean" }
                    },
                    "required": ["prompt", "options"]
                }),
            },
        ]
    }

    fn after_llm(&self, context: &StepContext, state: &StepState) -> Result<Vec<Instruction>, EngineError> {
        let mut calls = proposed_calls(context, state)?;
        calls.retain(|call| !state.rejected_tool_calls.contains(&call.id));

        if calls.is_empty() {
            return Ok(vec![Instruction::Finish {
                reason: "completed".to_string(),
            }]);
        }

        if let Some(call) = calls.iter().find(|c| c.api_name == ASK_HUMAN_TOOL) {
            return Ok(vec![Instruction::RequestHumanPrompt(prompt_from_call(call)?)]);
        }

        if let Some(call) = calls.iter().find(|c| c.api_name == ASK_HUMAN_SELECT_TOOL) {
            return Ok(vec![Instruction::RequestHumanSelect(select_from_call(call)?)]);
        }

        if calls.iter().any(|c| self.requires_approval(&c.api_name)) {
            return Ok(vec![Instruction::RequestHumanApprove(calls)]);
        }

        Ok(vec![Instruction::CallToolsBatch(calls)])
    }
}

#[async_trait]
impl Agent for GeneralAgent {
    async fn runner(
        &self,
        context: &StepContext,
        state: &StepState,
    ) -> Result<Vec<Instruction>, EngineError> {
        match context.phase {
            StepPhase::LlmResult => self.after_llm(context, state),
            StepPhase::HumanApprovedTool => {
                let approved: Vec<ToolCall> = context
                    .payload
                    .get("approvedToolCalls")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();

                if approved.is_empty() {
                    Ok(vec![Instruction::CallLlm])
                } else {
                    Ok(vec![Instruction::CallToolsBatch(approved)])
                }
            }
            StepPhase::Init
            | StepPhase::UserInput
            | StepPhase::HumanInput
            | StepPhase::HumanSelect
            | StepPhase::HumanRejectedTool
            | StepPhase::ToolResult
            | StepPhase::ToolsBatchResult
            | StepPhase::Error => Ok(vec![Instruction::CallLlm]),
        }
    }
}

/// Tool calls from the context payload, falling back to the last assistant
/// message
fn proposed_calls(context: &StepContext, state: &StepState) -> Result<Vec<ToolCall>, EngineError> {
    if let Some(calls) = context.payload.get("toolCalls") {
        return Ok(serde_json::from_value(calls.clone())?);
    }

    Ok(state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| m.tool_calls.clone())
        .unwrap_or_default())
}

fn gate_metadata(call: &ToolCall, args: &Value) -> Value {
    let mut metadata = match args.get("metadata") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };
    metadata["toolCallId"] = json!(call.id);
    metadata
}

fn prompt_from_call(call: &ToolCall) -> Result<HumanPrompt, EngineError> {
    let args = call.arguments_json()?;
    let prompt = args
        .get("prompt")
        .or_else(|| args.get("question"))
        .and_then(|p| p.as_str())
        .ok_or_else(|| EngineError::StepBody(format!("{} called without a prompt", ASK_HUMAN_TOOL)))?;

    Ok(HumanPrompt {
        prompt: prompt.to_string(),
        metadata: Some(gate_metadata(call, &args)),
    })
}

fn select_from_call(call: &ToolCall) -> Result<HumanSelect, EngineError> {
    let args = call.arguments_json()?;
    let prompt = args
        .get("prompt")
        .and_then(|p| p.as_str())
        .ok_or_else(|| {
            EngineError::StepBody(format!("{} called without a prompt", ASK_HUMAN_SELECT_TOOL))
        })?;

    let options: Vec<SelectOption> = args
        .get("options")
        .and_then(|o| o.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(SelectOption {
                        label: s.clone(),
                        value: s.clone(),
                    }),
                    Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if options.is_empty() {
        return Err(EngineError::StepBody(format!(
            "{} called without options",
            ASK_HUMAN_SELECT_TOOL
        )));
    }

    Ok(HumanSelect {
        prompt: prompt.to_string(),
        options,
        multi: args.get("multi").and_then(|m| m.as_bool()).unwrap_or(false),
        metadata: Some(gate_metadata(call, &args)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_result(calls: Vec<ToolCall>) -> StepContext {
        StepContext::new(
            StepPhase::LlmResult,
            json!({ "content": "", "toolCalls": calls }),
        )
    }

    fn state() -> StepState {
        StepState::new("op-1", vec![])
    }

    #[tokio::test]
    async fn test_input_phases_call_llm() {
        let agent = GeneralAgent::new(vec![]);
        for phase in [
            StepPhase::Init,
            StepPhase::UserInput,
            StepPhase::HumanInput,
            StepPhase::HumanRejectedTool,
            StepPhase::ToolsBatchResult,
            StepPhase::Error,
        ] {
            let context = StepContext::new(phase, Value::Null);
            assert_eq!(
                agent.runner(&context, &state()).await.unwrap(),
                vec![Instruction::CallLlm]
            );
        }
    }

    #[tokio::test]
    async fn test_reply_without_tools_finishes() {
        let agent = GeneralAgent::new(vec![]);
        let instructions = agent.runner(&llm_result(vec![]), &state()).await.unwrap();
        assert!(matches!(instructions[0], Instruction::Finish { .. }));
    }

    #[tokio::test]
    async fn test_plain_tools_run_in_batch() {
        let agent = GeneralAgent::new(vec!["deploy".to_string()]);
        let calls = vec![ToolCall::new("c1", "search", "{}")];
        let instructions = agent.runner(&llm_result(calls.clone()), &state()).await.unwrap();
        assert_eq!(instructions, vec![Instruction::CallToolsBatch(calls)]);
    }

    #[tokio::test]
    async fn test_approval_required() {
        let agent = GeneralAgent::new(vec!["deploy".to_string()]);
        let calls = vec![
            ToolCall::new("c1", "search", "{}"),
            ToolCall::new("c2", "deploy", "{}"),
        ];
        let instructions = agent.runner(&llm_result(calls.clone()), &state()).await.unwrap();
        assert_eq!(instructions, vec![Instruction::RequestHumanApprove(calls)]);

        let wildcard = GeneralAgent::new(vec!["*".to_string()]);
        assert!(wildcard.requires_approval("anything"));
        assert!(!wildcard.requires_approval(ASK_HUMAN_TOOL));
    }

    #[tokio::test]
    async fn test_ask_human_opens_prompt() {
        let agent = GeneralAgent::new(vec!["*".to_string()]);
        let calls = vec![ToolCall::new("c1", ASK_HUMAN_TOOL, r#"{"prompt":"Which env?"}"#)];
        let instructions = agent.runner(&llm_result(calls), &state()).await.unwrap();
        match &instructions[0] {
            Instruction::RequestHumanPrompt(prompt) => {
                assert_eq!(prompt.prompt, "Which env?");
                assert_eq!(prompt.metadata.as_ref().unwrap()["toolCallId"], "c1");
            }
            other => panic!("unexpected instruction: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ask_human_select_parses_options() {
        let agent = GeneralAgent::new(vec![]);
        let calls = vec![ToolCall::new(
            "c1",
            ASK_HUMAN_SELECT_TOOL,
            r#"{"prompt":"Pick","options":["a",{"label":"Bee","value":"b"}],"multi":true}"#,
        )];
        let instructions = agent.runner(&llm_result(calls), &state()).await.unwrap();
        match &instructions[0] {
            Instruction::RequestHumanSelect(select) => {
                assert_eq!(select.options.len(), 2);
                assert_eq!(select.options[1].value, "b");
                assert!(select.multi);
            }
            other => panic!("unexpected instruction: {:?}", other),
        }

        let bad = vec![ToolCall::new("c2", ASK_HUMAN_SELECT_TOOL, r#"{"prompt":"Pick"}"#)];
        assert!(agent.runner(&llm_result(bad), &state()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_calls_are_not_reproposed() {
        let agent = GeneralAgent::new(vec!["deploy".to_string()]);
        let mut state = state();
        state.rejected_tool_calls.push("c2".to_string());
        let calls = vec![ToolCall::new("c2", "deploy", "{}")];
        let instructions = agent.runner(&llm_result(calls), &state).await.unwrap();
        assert!(matches!(instructions[0], Instruction::Finish { .. }));
    }

    #[tokio::test]
    async fn test_approved_phase_runs_approved_calls() {
        let agent = GeneralAgent::new(vec![]);
        let calls = vec![ToolCall::new("c1", "deploy", "{}")];
        let context = StepContext::new(
            StepPhase::HumanApprovedTool,
            json!({ "approvedToolCalls": calls }),
        );
        assert_eq!(
            agent.runner(&context, &state()).await.unwrap(),
            vec![Instruction::CallToolsBatch(calls)]
        );
    }
}
