//! Agent Relay Kit (ARK) - orchestration core for cooperating conversational agents
//!
//! ARK provides a set of feature-gated modules:
//!
//! - **`config`** - TOML configuration and environment loading
//! - **`observability`** - Markdown audit logging
//! - **`orchestration`** - Handoffs, escalation, conversation context and the
//!   tool-resolution loop
//!
//! # Features
//!
//! ```toml
//! [dependencies]
//! ark = { version = "0.3", features = ["orchestration"] }
//! # Only the configuration layer:
//! ark = { version = "0.3", default-features = false, features = ["config"] }
//! ```
//!
//! # Example: Using the config feature
//!
//! ```ignore
//! use ark::config::{ConfigurationLoader, EnvironmentLoader};
//!
//! let env = EnvironmentLoader::new(None);
//! let loader = ConfigurationLoader::new(env.config_path().as_deref())?;
//!
//! println!("Max iterations: {}", loader.config.tool_loop.max_iterations);
//! println!("Supervisor: {}", loader.config.escalation.supervisor_agent);
//! ```
//!
//! # Example: Handing a session over
//!
//! ```ignore
//! use ark::orchestration::{EventLog, HandoffCoordinator, HandoffRequest, SessionState};
//! use std::sync::Arc;
//!
//! let coordinator = HandoffCoordinator::new(
//!     Arc::new(SessionState::new()),
//!     Arc::new(EventLog::new()),
//! );
//! coordinator.request_handoff(
//!     "session-1",
//!     HandoffRequest::new("greeter", "sales").with_trigger("user asked about products"),
//! )?;
//! ```

#![warn(missing_docs)]

/// Configuration management (enabled with the `config` feature)
#[cfg(feature = "config")]
pub mod config;

/// Observability utilities (enabled with the `observability` feature)
#[cfg(feature = "observability")]
pub mod observability;

/// Multi-agent orchestration (enabled with the `orchestration` feature)
#[cfg(feature = "orchestration")]
pub mod orchestration;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "config")]
    pub use crate::config::{ConfigurationLoader, EnvironmentLoader, OrchestrationConfig};

    #[cfg(feature = "observability")]
    pub use crate::observability::Logger;

    #[cfg(feature = "orchestration")]
    pub use crate::orchestration::{
        BackendRequest, BackendResponse, ConversationContextStore, EscalationAction,
        EscalationEngine, EscalationRule, EventLog, EventType, HandoffCoordinator,
        HandoffRequest, OrchestrationError, OrchestrationResult, Orchestrator,
        ReasoningBackend, SessionState, StateSynchronizer, Tool, ToolDefinition, ToolError,
        ToolInvocation, ToolOutcome, ToolRegistry, ToolResolutionLoop, TurnOutcome,
    };

    #[cfg(feature = "orchestration")]
    pub use tokio_util::sync::CancellationToken;
}
