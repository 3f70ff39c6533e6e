//! Error types and handling
//!
//! This module provides the error types used throughout waypoint.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints, indicates whether errors are recoverable, and places each error in
//! one of the categories the HTTP entry point maps to a status code.
//!
//! # Security
//!
//! All error messages are scrubbed to ensure:
//! - No signing keys or scheduler tokens are included
//! - No file paths are exposed to remote callers
//! - "Unknown operation" and "unauthorized operation" read identically

use thiserror::Error;

/// Broad class of an error, used to decide how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or missing signature, unknown operation. Never retried from here.
    Authentication,
    /// Malformed request or a human decision of the wrong kind.
    Validation,
    /// The agent itself failed; recorded in the step state, not a fault.
    Business,
    /// Duplicate or out-of-order delivery. Treated as a no-op success.
    Conflict,
    /// Anything else. Safe to redeliver because nothing was committed.
    System,
}

/// Trait for waypoint error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Secrets (signing keys, tokens)
    /// - File paths
    /// - Internal implementation details
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require caller correction or manual intervention.
    fn is_recoverable(&self) -> bool;

    /// Returns the category used for status-code mapping
    fn category(&self) -> ErrorCategory;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: SQLite operation failures
/// - **Authentication**: Signature and operation ownership failures
/// - **Validation**: Malformed step requests, mismatched human input
/// - **Concurrency**: Optimistic-concurrency conflicts on the state row
/// - **Scheduling**: Continuation publishing failures
/// - **Agent**: Model and tool collaborator failures
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorCategory, ErrorExt};
///
/// let error = EngineError::InvalidSignature;
/// assert_eq!(error.category(), ErrorCategory::Authentication);
/// assert!(!error.is_recoverable());
///
/// let error = EngineError::Validation("operationId is required".to_string());
/// assert_eq!(error.category(), ErrorCategory::Validation);
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Authentication errors
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid operation or unauthorized")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation is waiting for {expected}, but the request supplied {supplied}")]
    HumanInputMismatch {
        expected: &'static str,
        supplied: &'static str,
    },

    #[error("Operation {0} already exists")]
    OperationExists(String),

    #[error("Operation {id} cannot be started: {reason}")]
    InvalidTransition { id: String, reason: String },

    // State errors
    #[error("Step state not found for operation {0}")]
    StateNotFound(String),

    #[error("Step state for {id} moved past step {expected}")]
    StateConflict { id: String, expected: u64 },

    #[error("Step state is corrupt: {0}")]
    CorruptState(String),

    // Scheduling errors
    #[error("Failed to schedule next step: {0}")]
    Scheduling(String),

    // Agent errors
    #[error("Step body failed: {0}")]
    StepBody(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model call timed out")]
    ModelTimeout,

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your configuration file",
            Self::Database(_) => "Database operation failed. Try again",

            Self::InvalidSignature => "Request signature could not be verified",
            Self::Unauthorized => "Invalid operation or unauthorized",

            Self::Validation(_) => "The request is malformed",
            Self::HumanInputMismatch { .. } => {
                "The supplied decision does not match what the operation is waiting for"
            }
            Self::OperationExists(_) => "Choose a different operation id",
            Self::InvalidTransition { .. } => "The operation is not in a startable state",

            Self::StateNotFound(_) => "Operation state is missing",
            Self::StateConflict { .. } => "The step was already processed",
            Self::CorruptState(_) => "Operation state could not be read",

            Self::Scheduling(_) => "Next step could not be scheduled. It will be retried",

            Self::StepBody(_) => "The agent step failed",
            Self::Model(_) => "Model provider failed. Try again",
            Self::ModelTimeout => "Model provider took too long to respond. Try again",
            Self::ToolNotFound(_) => "The requested tool is not available",
            Self::ToolError(_) => "Tool operation failed",

            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Serialization(_) => "Data could not be encoded or decoded",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidSignature
            | Self::Unauthorized
            | Self::Validation(_)
            | Self::HumanInputMismatch { .. }
            | Self::OperationExists(_)
            | Self::InvalidTransition { .. }
            | Self::CorruptState(_)
            | Self::Config(_) => false,

            _ => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidSignature | Self::Unauthorized => ErrorCategory::Authentication,

            Self::Validation(_)
            | Self::HumanInputMismatch { .. }
            | Self::OperationExists(_)
            | Self::InvalidTransition { .. } => ErrorCategory::Validation,

            Self::StateConflict { .. } => ErrorCategory::Conflict,

            Self::StepBody(_)
            | Self::Model(_)
            | Self::ModelTimeout
            | Self::ToolNotFound(_)
            | Self::ToolError(_) => ErrorCategory::Business,

            _ => ErrorCategory::System,
        }
    }
}
