//! Handle types connecting the HTTP layer to the engine
//!
//! `RunContext` is the only API surface the HTTP entry point sees. Each handle
//! wraps an implementation trait the engine provides, so the server crate
//! never depends on the engine's concrete types.

use crate::errors::EngineError;
use crate::operations::{
    CancelResult, CreateOperationParams, CreateOperationResult, InterventionAction,
    InterventionFilter, OperationStatusReport, PendingInterventionsReport, ScheduleReceipt,
    StartExecutionParams,
};
use crate::step::{OperationMetadata, StepRequest, StepResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Handles available to a request handler
#[derive(Clone)]
pub struct RunContext {
    /// Metadata lookup and step execution
    pub executor: ExecutorHandle,

    /// Operation management
    pub operations: OperationsHandle,

    /// Scheduler signature checks
    pub verifier: VerifierHandle,
}

impl RunContext {
    pub fn new(
        executor: ExecutorHandle,
        operations: OperationsHandle,
        verifier: VerifierHandle,
    ) -> Self {
        Self {
            executor,
            operations,
            verifier,
        }
    }
}

/// Handle for step execution
#[derive(Clone)]
pub struct ExecutorHandle {
    inner: Arc<dyn ExecutorHandleImpl>,
}

impl ExecutorHandle {
    pub fn new(inner: Arc<dyn ExecutorHandleImpl>) -> Self {
        Self { inner }
    }

    /// Look up the ownership record of an operation
    pub async fn metadata(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationMetadata>, EngineError> {
        self.inner.metadata(operation_id).await
    }

    /// Run one step on behalf of `owner_user_id`
    pub async fn execute_step(
        &self,
        owner_user_id: &str,
        request: StepRequest,
    ) -> Result<StepResult, EngineError> {
        self.inner.execute_step(owner_user_id, request).await
    }
}

/// Trait for executor handle implementation (to be implemented by engine)
#[async_trait]
pub trait ExecutorHandleImpl: Send + Sync {
    async fn metadata(&self, operation_id: &str)
        -> Result<Option<OperationMetadata>, EngineError>;

    async fn execute_step(
        &self,
        owner_user_id: &str,
        request: StepRequest,
    ) -> Result<StepResult, EngineError>;
}

/// Handle for operation management
#[derive(Clone)]
pub struct OperationsHandle {
    inner: Arc<dyn OperationsHandleImpl>,
}

impl OperationsHandle {
    pub fn new(inner: Arc<dyn OperationsHandleImpl>) -> Self {
        Self { inner }
    }

    pub async fn create(
        &self,
        params: CreateOperationParams,
    ) -> Result<CreateOperationResult, EngineError> {
        self.inner.create(params).await
    }

    /// Progress report, `None` for unknown operations
    pub async fn status(
        &self,
        operation_id: &str,
        include_history: bool,
        history_limit: u32,
    ) -> Result<Option<OperationStatusReport>, EngineError> {
        self.inner
            .status(operation_id, include_history, history_limit)
            .await
    }

    pub async fn pending(
        &self,
        filter: InterventionFilter,
    ) -> Result<PendingInterventionsReport, EngineError> {
        self.inner.pending(filter).await
    }

    pub async fn start(
        &self,
        operation_id: &str,
        params: StartExecutionParams,
    ) -> Result<ScheduleReceipt, EngineError> {
        self.inner.start(operation_id, params).await
    }

    pub async fn intervene(
        &self,
        operation_id: &str,
        action: InterventionAction,
    ) -> Result<ScheduleReceipt, EngineError> {
        self.inner.intervene(operation_id, action).await
    }

    pub async fn cancel(&self, operation_id: &str) -> Result<CancelResult, EngineError> {
        self.inner.cancel(operation_id).await
    }
}

/// Trait for operations handle implementation (to be implemented by engine)
#[async_trait]
pub trait OperationsHandleImpl: Send + Sync {
    async fn create(
        &self,
        params: CreateOperationParams,
    ) -> Result<CreateOperationResult, EngineError>;

    async fn status(
        &self,
        operation_id: &str,
        include_history: bool,
        history_limit: u32,
    ) -> Result<Option<OperationStatusReport>, EngineError>;

    async fn pending(
        &self,
        filter: InterventionFilter,
    ) -> Result<PendingInterventionsReport, EngineError>;

    async fn start(
        &self,
        operation_id: &str,
        params: StartExecutionParams,
    ) -> Result<ScheduleReceipt, EngineError>;

    async fn intervene(
        &self,
        operation_id: &str,
        action: InterventionAction,
    ) -> Result<ScheduleReceipt, EngineError>;

    async fn cancel(&self, operation_id: &str) -> Result<CancelResult, EngineError>;
}

/// Handle for signature verification
#[derive(Clone)]
pub struct VerifierHandle {
    inner: Arc<dyn VerifierHandleImpl>,
}

impl VerifierHandle {
    pub fn new(inner: Arc<dyn VerifierHandleImpl>) -> Self {
        Self { inner }
    }

    /// False when no keys are configured and enforcement is skipped
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Name of the header carrying the signature
    pub fn header_name(&self) -> &str {
        self.inner.header_name()
    }

    /// Check `raw_body` against the signature header. Never errors.
    pub fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> bool {
        self.inner.verify(raw_body, signature)
    }
}

/// Trait for verifier handle implementation (to be implemented by engine)
pub trait VerifierHandleImpl: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn header_name(&self) -> &str;

    fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> bool;
}
