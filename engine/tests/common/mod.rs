//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::operations::CreateOperationParams;
use sdk::step::StepRequest;
use sdk::types::{Message, ToolCall};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use waypoint_engine::agent::{
    AgentRuntime, GeneralAgent, ModelClient, ModelReply, ToolDefinition, ToolExecutor, ToolOutcome,
};
use waypoint_engine::db::Database;
use waypoint_engine::executor::StepExecutor;
use waypoint_engine::scheduler::{ContinuationScheduler, ScheduledStep};
use waypoint_engine::service::OperationService;

pub const OWNER: &str = "user-1";

/// Model that replays a fixed list of replies
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, EngineError>>>,
    calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<ModelReply, EngineError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ModelReply, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::Model("script exhausted".to_string())))
    }
}

pub fn text(content: &str, cost: f64) -> Result<ModelReply, EngineError> {
    Ok(ModelReply {
        content: content.to_string(),
        cost,
        ..ModelReply::default()
    })
}

pub fn calling(calls: Vec<ToolCall>, cost: f64) -> Result<ModelReply, EngineError> {
    Ok(ModelReply {
        tool_calls: calls,
        cost,
        ..ModelReply::default()
    })
}

/// Tool executor that records every call and answers with its name
#[derive(Default)]
pub struct RecordingTools {
    pub executed: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn definitions(&self) -> Result<Vec<ToolDefinition>, EngineError> {
        Ok(["search", "deploy"]
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: String::new(),
                parameters: serde_json::json!({ "type": "object" }),
            })
            .collect())
    }

    async fn execute(&self, call: &ToolCall, _owner: &str) -> Result<ToolOutcome, EngineError> {
        self.executed.lock().unwrap().push(call.api_name.clone());
        Ok(ToolOutcome {
            content: format!("{} ok", call.api_name),
            cost: 0.001,
            is_error: false,
        })
    }
}

/// Scheduler that keeps every step it is given, failing the first
/// `failures` attempts
#[derive(Default)]
pub struct RecordingScheduler {
    pub steps: Mutex<Vec<ScheduledStep>>,
    failures: AtomicU32,
}

impl RecordingScheduler {
    pub fn failing(failures: u32) -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            failures: AtomicU32::new(failures),
        }
    }

    pub fn count(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    pub fn last(&self) -> ScheduledStep {
        self.steps
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing scheduled")
    }
}

#[async_trait]
impl ContinuationScheduler for RecordingScheduler {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn schedule(&self, step: ScheduledStep) -> Result<String, EngineError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Scheduling("publish returned 503".to_string()));
        }

        let mut steps = self.steps.lock().unwrap();
        steps.push(step);
        Ok(format!("msg-{}", steps.len()))
    }
}

/// Executor, service, and collaborators over a temporary database
pub struct Harness {
    _dir: TempDir,
    pub db: Database,
    pub model: Arc<ScriptedModel>,
    pub tools: Arc<RecordingTools>,
    pub scheduler: Arc<RecordingScheduler>,
    pub executor: Arc<StepExecutor>,
    pub service: OperationService,
}

impl Harness {
    pub async fn new(replies: Vec<Result<ModelReply, EngineError>>) -> Self {
        Self::build(replies, vec!["deploy".to_string()], RecordingScheduler::default()).await
    }

    pub async fn build(
        replies: Vec<Result<ModelReply, EngineError>>,
        require_approval: Vec<String>,
        scheduler: RecordingScheduler,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("waypoint.db")).await.unwrap();

        let model = ScriptedModel::new(replies);
        let tools = Arc::new(RecordingTools::default());
        let scheduler = Arc::new(scheduler);

        let runtime = AgentRuntime::new(
            Arc::new(GeneralAgent::new(require_approval)),
            Arc::clone(&model) as Arc<dyn ModelClient>,
            Arc::clone(&tools) as Arc<dyn ToolExecutor>,
        );
        let executor = Arc::new(
            StepExecutor::new(
                &db,
                Arc::new(runtime),
                Some(Arc::clone(&scheduler) as Arc<dyn ContinuationScheduler>),
                "http://localhost/agent/run",
            )
            .with_base_delay(Duration::from_millis(50)),
        );
        let service = OperationService::new(Arc::clone(&executor));

        Self {
            _dir: dir,
            db,
            model,
            tools,
            scheduler,
            executor,
            service,
        }
    }

    /// Create an idle operation without scheduling anything
    pub async fn create(&self, operation_id: &str) {
        self.service
            .create_operation(CreateOperationParams {
                operation_id: operation_id.to_string(),
                owner_user_id: OWNER.to_string(),
                messages: vec![Message::user("deploy the site")],
                max_steps: None,
                cost_limit: None,
                initial_context: None,
                auto_start: false,
            })
            .await
            .unwrap();
    }

    /// Deliver the most recently scheduled request, as the scheduler would
    pub async fn deliver_last(&self) -> sdk::step::StepResult {
        let request = self.scheduler.last().request;
        self.executor.execute_step(OWNER, request).await.unwrap()
    }

    pub async fn deliver(&self, request: StepRequest) -> Result<sdk::step::StepResult, EngineError> {
        self.executor.execute_step(OWNER, request).await
    }
}
