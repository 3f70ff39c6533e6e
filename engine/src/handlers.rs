//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - serve: Run the HTTP server and the scheduler worker
//! - create: Create an operation
//! - status: Show an operation's progress
//! - run: Drive an operation in-process
//! - pending: List operations waiting for a human
//! - cancel: Cancel an operation
//! - sign: Produce a scheduler signature header

use anyhow::{Context, Result};
use api_server::{ApiServer, ServerOptions};
use sdk::handles::{
    ExecutorHandle, ExecutorHandleImpl, OperationsHandle, OperationsHandleImpl, RunContext,
    VerifierHandle, VerifierHandleImpl,
};
use sdk::operations::{CreateOperationParams, InterventionFilter};
use sdk::types::Message;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::general::GeneralAgent;
use crate::agent::model::{ModelClient, OpenAiModelClient};
use crate::agent::tools::{GatewayToolExecutor, NoTools, ToolExecutor};
use crate::agent::AgentRuntime;
use crate::config::Config;
use crate::crypto::{parse_signing_key, sign_payload, SignatureVerifier};
use crate::db::Database;
use crate::executor::StepExecutor;
use crate::scheduler::{LocalQueue, SchedulerSetup};
use crate::service::OperationService;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Everything a command needs, built from the configuration
pub struct Engine {
    pub database: Database,
    pub service: Arc<OperationService>,
    pub verifier: Arc<SignatureVerifier>,
    local_queue: Option<LocalQueue>,
}

impl Engine {
    /// Open the database and wire the executor, scheduler, and service
    pub async fn open(config: &Config) -> Result<Self> {
        let database = Database::new(&config.database_path())
            .await
            .context("Failed to open database")?;

        let model: Arc<dyn ModelClient> = Arc::new(OpenAiModelClient::new(&config.agent));
        let tools: Arc<dyn ToolExecutor> = match &config.agent.gateway_url {
            Some(url) => Arc::new(GatewayToolExecutor::new(url.clone())),
            None => Arc::new(NoTools),
        };
        let agent = Arc::new(GeneralAgent::new(config.agent.require_approval.clone()));
        let runtime = AgentRuntime::new(agent, model, tools)
            .with_system_prompt(config.agent.system_prompt.clone());

        let setup = SchedulerSetup::from_config(config).context("Failed to set up scheduler")?;

        let executor = StepExecutor::new(
            &database,
            Arc::new(runtime),
            setup.scheduler,
            config.run_endpoint(),
        )
        .with_base_delay(Duration::from_millis(config.scheduler.base_delay_ms));

        let service = OperationService::new(Arc::new(executor)).with_defaults(
            config.executor.default_max_steps,
            config.executor.cost_limit.as_ref().map(|limit| limit.to_limit()),
        );

        let verifier =
            SignatureVerifier::from_config(&config.signing).context("Invalid signing keys")?;

        Ok(Self {
            database,
            service: Arc::new(service),
            verifier: Arc::new(verifier),
            local_queue: setup.local_queue,
        })
    }

    /// Handles for the HTTP layer
    pub fn run_context(&self) -> RunContext {
        let executor: Arc<dyn ExecutorHandleImpl> = Arc::clone(self.service.executor()) as _;
        let operations: Arc<dyn OperationsHandleImpl> = Arc::clone(&self.service) as _;
        let verifier: Arc<dyn VerifierHandleImpl> = Arc::clone(&self.verifier) as _;

        RunContext::new(
            ExecutorHandle::new(executor),
            OperationsHandle::new(operations),
            VerifierHandle::new(verifier),
        )
    }

    /// Flush the WAL and close the pool
    async fn shutdown(self) {
        if let Err(e) = self.database.close().await {
            tracing::error!("Failed to close database: {}", e);
        }
    }
}

/// Serve the step endpoint until Ctrl-C
pub async fn handle_serve(config: &Config) -> Result<()> {
    let mut engine = Engine::open(config).await?;
    let ctx = engine.run_context();

    let worker = engine
        .local_queue
        .take()
        .map(|queue| queue.spawn_worker(ctx.executor.clone()));

    let active = engine
        .service
        .executor()
        .states()
        .list_active()
        .await
        .context("Failed to list active operations")?;
    if !active.is_empty() {
        tracing::info!(
            "{} operation(s) running or waiting; running ones resume on scheduler redelivery",
            active.len()
        );
    }

    if !engine.verifier.is_enabled() {
        tracing::warn!("No signing keys configured, /agent/run accepts unsigned requests");
    }

    let options = ServerOptions {
        api_token: config.server.api_token.clone(),
    };
    let server = ApiServer::start(ctx, options, &config.server.bind_addr)
        .await
        .context("Failed to start API server")?;
    println!("Waypoint listening on http://{}", server.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C, starting graceful shutdown");

    server.stop().await;
    if let Some(worker) = worker {
        worker.abort();
    }
    engine.shutdown().await;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Create an operation from a single user message
pub async fn handle_create(
    config: &Config,
    params: CreateArgs,
    format: OutputFormat,
) -> Result<()> {
    let engine = Engine::open(config).await?;

    let result = engine
        .service
        .create_operation(CreateOperationParams {
            operation_id: params.operation_id,
            owner_user_id: params.user,
            messages: vec![Message::user(params.message)],
            max_steps: params.max_steps,
            cost_limit: None,
            initial_context: None,
            auto_start: params.auto_start,
        })
        .await?;

    match format {
        OutputFormat::Text => {
            println!("Created operation {}", result.operation_id);
            match &result.message_id {
                Some(id) if engine.local_queue.is_some() => println!(
                    "  First step queued in this process only ({}); use `waypoint run {}` or `waypoint serve`",
                    id, result.operation_id
                ),
                Some(id) => println!("  First step scheduled ({})", id),
                None => println!("  Not started"),
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    engine.shutdown().await;
    Ok(())
}

/// Arguments of `waypoint create`
#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub operation_id: String,
    pub user: String,
    pub message: String,
    pub max_steps: Option<u64>,
    pub auto_start: bool,
}

/// Show an operation's status and optionally its history
pub async fn handle_status(
    config: &Config,
    operation_id: &str,
    history: bool,
    limit: u32,
    format: OutputFormat,
) -> Result<()> {
    let engine = Engine::open(config).await?;

    let report = engine
        .service
        .get_operation_status(operation_id, history, Some(limit))
        .await?
        .with_context(|| format!("Operation {} not found", operation_id))?;

    match format {
        OutputFormat::Text => {
            println!("Operation {}", report.operation_id);
            println!("  Owner:  {}", report.owner_user_id);
            println!("  Status: {}", report.status);
            println!("  Steps:  {}", report.stats.total_steps);
            println!(
                "  Cost:   {:.6} ({} messages)",
                report.stats.total_cost, report.stats.total_messages
            );
            if let Some(pending) = &report.pending {
                println!("  Waiting for: {}", pending.intervention_type);
            }
            if let Some(error) = &report.error {
                println!("  Error: {} ({})", error.message, error.kind);
            }

            if let Some(entries) = &report.history {
                println!();
                for entry in entries {
                    println!(
                        "  #{:<4} {:<18} +{:.6}  {}ms  {}",
                        entry.step_index,
                        entry.status,
                        entry.cost_delta,
                        entry.execution_time_ms,
                        entry.summary
                    );
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    engine.shutdown().await;
    Ok(())
}

/// Execute an operation in this process until it stops
pub async fn handle_run(
    config: &Config,
    operation_id: &str,
    max_steps: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let engine = Engine::open(config).await?;

    let state = engine
        .service
        .execute_sync(operation_id, max_steps)
        .await
        .with_context(|| format!("Failed to run operation {}", operation_id))?;

    match format {
        OutputFormat::Text => {
            println!("Operation {} is {}", state.operation_id, state.status.kind());
            println!("  Steps: {}", state.step_count);
            println!("  Cost:  {:.6} {}", state.cost.total, state.cost.currency);
            if let Some(reply) = state
                .messages
                .iter()
                .rev()
                .find(|m| m.role == sdk::types::MessageRole::Assistant && !m.content.is_empty())
            {
                println!();
                println!("{}", reply.content);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "operationId": state.operation_id,
                "status": state.status.kind(),
                "stepCount": state.step_count,
                "cost": state.cost,
                "usage": state.usage,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// List operations waiting for a human
pub async fn handle_pending(
    config: &Config,
    user: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let engine = Engine::open(config).await?;

    let report = engine
        .service
        .pending_interventions(InterventionFilter {
            operation_id: None,
            user_id: user,
        })
        .await?;

    match format {
        OutputFormat::Text => {
            if report.interventions.is_empty() {
                println!("No operations are waiting for input");
            }
            for pending in &report.interventions {
                println!(
                    "{}  {}  (step {})",
                    pending.operation_id, pending.intervention_type, pending.step_count
                );
                if let Some(calls) = &pending.pending_tools_calling {
                    for call in calls {
                        println!("    {} {}", call.api_name, call.arguments);
                    }
                }
                if let Some(prompt) = &pending.pending_human_prompt {
                    println!("    {}", prompt.prompt);
                }
                if let Some(select) = &pending.pending_human_select {
                    println!("    {}", select.prompt);
                    for option in &select.options {
                        println!("      - {} ({})", option.label, option.value);
                    }
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    engine.shutdown().await;
    Ok(())
}

/// Cancel an operation
pub async fn handle_cancel(config: &Config, operation_id: &str, format: OutputFormat) -> Result<()> {
    let engine = Engine::open(config).await?;

    let result = engine.service.cancel(operation_id).await?;

    match format {
        OutputFormat::Text => {
            if result.cancelled {
                println!("Cancelled {} (was {})", result.operation_id, result.previous_status);
            } else {
                println!(
                    "{} already finished with status {}",
                    result.operation_id, result.previous_status
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    engine.shutdown().await;
    Ok(())
}

/// Print a signature header for a request body
pub fn handle_sign(key: &str, body: &str, timestamp: Option<i64>, format: OutputFormat) -> Result<()> {
    let signing_key = parse_signing_key(key)?;

    let payload = if body == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read body from stdin")?;
        buf
    } else {
        std::fs::read(body).with_context(|| format!("Failed to read {}", body))?
    };

    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let header = sign_payload(&signing_key, &payload, timestamp);

    match format {
        OutputFormat::Text => println!("{}", header),
        OutputFormat::Json => {
            let output = json!({
                "header": header,
                "timestamp": timestamp,
                "verifyingKey": hex::encode(signing_key.verifying_key().to_bytes()),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
