//! Error types for orchestration operations

use thiserror::Error;

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Failures surfaced to callers of the orchestration core.
///
/// Tool failures are normally folded into the transcript by the
/// tool-resolution loop; `ToolExecution` only reaches a caller when a tool
/// is invoked directly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Handoff to '{target}' would create circular loop")]
    CircularHandoff { target: String },

    #[error("Maximum iterations exceeded ({iterations})")]
    MaxIterationsExceeded { iterations: u32 },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl OrchestrationError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a session-not-found error
    pub fn session_not_found<S: Into<String>>(session_id: S) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Message safe to show to an end user.
    ///
    /// Transport failures are reported generically; the detail stays in
    /// the event log.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. } => {
                "The assistant is temporarily unavailable. Please try again.".to_string()
            }
            Self::MaxIterationsExceeded { .. } => {
                "Maximum iterations exceeded while resolving tool calls".to_string()
            }
            other => other.to_string(),
        }
    }
}
