//! Continuation scheduling
//!
//! After a step that leaves more work, the executor asks a
//! `ContinuationScheduler` to deliver the next step request to the run
//! endpoint. Delivery is at-least-once in every implementation; the executor
//! makes redelivery harmless.
//!
//! - `HttpScheduler` publishes to an external push scheduler
//! - `LocalScheduler` delivers through an in-process worker
//! - disabled mode has no scheduler at all; steps are driven by hand

pub mod http;
pub mod local;

pub use http::HttpScheduler;
pub use local::{LocalQueue, LocalScheduler};

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::step::StepRequest;
use sdk::types::Priority;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SchedulerMode};

/// A step request waiting to be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStep {
    /// URL the request is delivered to
    pub endpoint: String,
    pub request: StepRequest,
    pub delay: Duration,
    pub priority: Priority,
}

#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Hand a step to the scheduler and return its message id
    async fn schedule(&self, step: ScheduledStep) -> Result<String, EngineError>;
}

/// Scheduler selected by configuration
pub struct SchedulerSetup {
    pub scheduler: Option<Arc<dyn ContinuationScheduler>>,
    /// Receiving end of the local scheduler; the caller spawns its worker
    /// once the executor exists
    pub local_queue: Option<LocalQueue>,
}

impl SchedulerSetup {
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        match config.scheduler.mode {
            SchedulerMode::Http => {
                let scheduler = HttpScheduler::from_config(&config.scheduler)?;
                Ok(Self {
                    scheduler: Some(Arc::new(scheduler)),
                    local_queue: None,
                })
            }
            SchedulerMode::Local => {
                let (scheduler, queue) = LocalScheduler::new();
                Ok(Self {
                    scheduler: Some(Arc::new(scheduler)),
                    local_queue: Some(queue),
                })
            }
            SchedulerMode::Disabled => {
                tracing::warn!("Continuation scheduling is disabled");
                Ok(Self {
                    scheduler: None,
                    local_queue: None,
                })
            }
        }
    }
}
