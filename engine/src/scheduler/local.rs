//! In-process scheduler
//!
//! `LocalScheduler` pushes steps onto a channel; the worker spawned from
//! `LocalQueue` waits out each step's delay and hands the request to the
//! executor the same way the run endpoint does: look up the owner, then
//! execute.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::handles::ExecutorHandle;
use sdk::step::StepRequest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ContinuationScheduler, ScheduledStep};

pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<ScheduledStep>,
}

/// Receiving end of a `LocalScheduler`
pub struct LocalQueue {
    rx: mpsc::UnboundedReceiver<ScheduledStep>,
}

impl LocalScheduler {
    pub fn new() -> (Self, LocalQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, LocalQueue { rx })
    }
}

#[async_trait]
impl ContinuationScheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn schedule(&self, step: ScheduledStep) -> Result<String, EngineError> {
        let message_id = format!("local-{}", uuid::Uuid::new_v4());
        debug!(
            "Queued step {} of {} ({}, {} priority, {:?} delay)",
            step.request.step_index,
            step.request.operation_id,
            message_id,
            step.priority.as_str(),
            step.delay
        );

        self.tx
            .send(step)
            .map_err(|_| EngineError::Scheduling("local worker has stopped".to_string()))?;

        Ok(message_id)
    }
}

impl LocalQueue {
    /// Next queued step, `None` once every scheduler handle is gone
    pub async fn recv(&mut self) -> Option<ScheduledStep> {
        self.rx.recv().await
    }

    /// Deliver queued steps to `executor` until the scheduler is dropped
    pub fn spawn_worker(mut self, executor: ExecutorHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Local scheduler worker started");

            while let Some(step) = self.recv().await {
                let executor = executor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(step.delay).await;
                    deliver(&executor, step.request).await;
                });
            }

            info!("Local scheduler worker stopped");
        })
    }
}

async fn deliver(executor: &ExecutorHandle, request: StepRequest) {
    let operation_id = request.operation_id.clone();
    let step_index = request.step_index;

    let owner = match executor.metadata(&operation_id).await {
        Ok(Some(metadata)) => metadata.owner_user_id,
        Ok(None) => {
            warn!("Dropping step {} for unknown operation {}", step_index, operation_id);
            return;
        }
        Err(e) => {
            warn!("Metadata lookup for {} failed: {}", operation_id, e);
            return;
        }
    };

    match executor.execute_step(&owner, request).await {
        Ok(result) if result.success => debug!(
            "Local delivery of step {} for {} finished with {}",
            step_index,
            operation_id,
            result.state.status.kind()
        ),
        Ok(result) => warn!(
            "Step {} for {} did not schedule its continuation: {}",
            step_index,
            operation_id,
            result.schedule_error.unwrap_or_default()
        ),
        Err(e) => warn!("Local delivery of step {} for {} failed: {}", step_index, operation_id, e),
    }
}
