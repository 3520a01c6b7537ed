//! Multi-agent orchestration core
//!
//! Several cooperating agents share one conversation. This module provides:
//! - Handoff legality and loop suppression per session
//! - Rule-based and classifier-based escalation
//! - Conversation context with analytics, snapshots, expiry and merge
//! - A synchronizer that keeps session state and context consistent
//! - The bounded tool-resolution loop in front of a reasoning backend
//!
//! Every component is an explicit service object. [`Orchestrator`] wires one
//! instance of each together; the components can also be used on their own.

pub mod context;
pub mod error;
pub mod escalation;
pub mod events;
pub mod handoff;
pub mod orchestrator;
pub mod runtime;
pub mod session;
pub mod sync;
pub mod tools;

// Re-export main types
pub use context::{
    ContextExport, ContextMetadata, ContextSnapshot, ContextUpdate, ConversationContext,
    ConversationContextStore, Message, MessageRole, SatisfactionIndicators, SessionAnalytics,
    ToolCallRecord,
};
pub use error::{OrchestrationError, OrchestrationResult};
pub use escalation::{
    EscalationAction, EscalationEngine, EscalationOutcome, EscalationPayload, EscalationRule,
    EscalationSource, Route, RoutingClassifier,
};
pub use events::{EventData, EventLog, EventType, OrchestrationEvent};
pub use handoff::{HandoffCoordinator, Scenario};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, TurnOutcome};
pub use runtime::{
    BackendRequest, BackendResponse, OutputItem, ReasoningBackend, Resolution, RuntimeConfig,
    ToolResolutionLoop, TranscriptItem,
};
pub use session::{
    ContextValue, HandoffPolicy, HandoffRecord, HandoffRequest, Session, SessionState, ValueType,
};
pub use sync::{StateSynchronizer, Subscription, SyncEvent, SyncEventKind, SynchronizedState};
pub use tools::{
    Tool, ToolCoordinator, ToolDefinition, ToolError, ToolErrorKind, ToolExecutionResult,
    ToolInvocation, ToolOutcome, ToolRegistry,
};
