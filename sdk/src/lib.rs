//! Waypoint SDK
//!
//! Shared vocabulary for waypoint components: the error taxonomy, the
//! operation data model, and the handles through which the HTTP layer
//! reaches the engine.

/// Error types and handling
pub mod errors;

/// Conversation, cost and usage types
pub mod types;

/// Operation state machine shape
pub mod state;

/// Step request/result types
pub mod step;

/// Operation management types
pub mod operations;

/// Engine handles
pub mod handles;

// Re-export commonly used types
pub use errors::{EngineError, ErrorCategory, ErrorExt};
pub use handles::{
    ExecutorHandle, ExecutorHandleImpl, OperationsHandle, OperationsHandleImpl, RunContext,
    VerifierHandle, VerifierHandleImpl,
};
pub use state::{
    HumanPrompt, HumanSelect, OperationStatus, PendingReason, SelectOption, StatusKind,
    StepContext, StepPhase, StepState,
};
pub use step::{ApprovalDecision, OperationMetadata, StepRequest, StepResult};
pub use types::{
    Cost, CostLimit, CostLimitAction, Message, MessageRole, Priority, StepError, ToolCall, Usage,
};
