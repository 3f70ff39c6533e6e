//! External push scheduler client
//!
//! Publishes a step request with one POST to the scheduler's publish URL:
//!
//! - `Authorization: Bearer <token>`
//! - `x-scheduler-destination`: the run endpoint to deliver to
//! - `x-scheduler-delay-ms`, `x-scheduler-priority`
//! - body: the step request exactly as it must arrive at the run endpoint
//!
//! The scheduler answers with `{"messageId": "..."}`. Server errors and
//! network failures are retried with exponential backoff; client errors are
//! not.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ContinuationScheduler, ScheduledStep};
use crate::config::SchedulerConfig;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: Option<String>,
}

pub struct HttpScheduler {
    publish_url: String,
    token: Option<String>,
    max_attempts: u32,
    initial_backoff: Duration,
    client: reqwest::Client,
}

impl HttpScheduler {
    pub fn new(publish_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            publish_url: publish_url.into(),
            token,
            max_attempts: 3,
            initial_backoff: INITIAL_BACKOFF,
            client,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, EngineError> {
        let url = config.publish_url.clone().ok_or_else(|| {
            EngineError::Config("scheduler.publish_url is not set".to_string())
        })?;

        Ok(Self::new(url, config.token.clone(), Duration::from_secs(config.timeout_secs))
            .with_retry(config.max_attempts, INITIAL_BACKOFF))
    }

    pub fn with_retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// One publish attempt; `Ok(Err(_))` means the failure is worth retrying
    async fn publish(&self, step: &ScheduledStep) -> Result<Result<String, String>, EngineError> {
        let mut request = self
            .client
            .post(&self.publish_url)
            .header("x-scheduler-destination", &step.endpoint)
            .header("x-scheduler-delay-ms", step.delay.as_millis().to_string())
            .header("x-scheduler-priority", step.priority.as_str())
            .json(&step.request);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(Err(format!("network error: {}", e))),
        };

        let status = response.status();
        if status.is_server_error() {
            return Ok(Err(format!("scheduler returned {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Scheduling(format!(
                "scheduler rejected the step with {}: {}",
                status, text
            )));
        }

        let body: PublishResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Scheduling(format!("unreadable scheduler reply: {}", e)))?;

        Ok(Ok(body.message_id.unwrap_or_else(|| {
            format!(
                "{}:{}",
                step.request.operation_id, step.request.step_index
            )
        })))
    }
}

#[async_trait]
impl ContinuationScheduler for HttpScheduler {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn schedule(&self, step: ScheduledStep) -> Result<String, EngineError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.publish(&step).await? {
                Ok(message_id) => {
                    debug!(
                        "Published step {} of {} as {}",
                        step.request.step_index, step.request.operation_id, message_id
                    );
                    return Ok(message_id);
                }
                Err(reason) => {
                    warn!(
                        "Publishing step {} of {} failed (attempt {}/{}): {}",
                        step.request.step_index,
                        step.request.operation_id,
                        attempt,
                        self.max_attempts,
                        reason
                    );
                    last_error = reason;
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(EngineError::Scheduling(last_error))
    }
}
