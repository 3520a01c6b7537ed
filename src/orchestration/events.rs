//! Append-only orchestration event log
//!
//! Every handoff, escalation, tool call and failure in the core is recorded
//! here. Reads can filter by agent or by event type. An optional markdown
//! audit [`Logger`] mirrors each entry to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

use super::context::ToolCallRecord;
use super::escalation::EscalationPayload;
use crate::observability::Logger;

/// Event types for the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    AgentStart,
    AgentEnd,
    ToolCall,
    HandoffRequested,
    HandoffCompleted,
    Escalation,
    Error,
}

impl EventType {
    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent-start",
            Self::AgentEnd => "agent-end",
            Self::ToolCall => "tool-call",
            Self::HandoffRequested => "handoff-requested",
            Self::HandoffCompleted => "handoff-completed",
            Self::Escalation => "escalation",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed payload attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    None,
    Turn {
        session_id: String,
        message: Option<String>,
    },
    Handoff {
        session_id: String,
        source: String,
        target: String,
        trigger: String,
    },
    Escalation(EscalationPayload),
    ToolCall(ToolCallRecord),
    Failure {
        session_id: Option<String>,
        stage: String,
    },
}

impl Default for EventData {
    fn default() -> Self {
        Self::None
    }
}

/// One immutable log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub id: uuid::Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub data: EventData,
    pub error: Option<String>,
}

/// In-memory append-only event log.
///
/// Growth is unbounded; long-running hosts call [`EventLog::clear`] when
/// they have drained what they need.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<OrchestrationEvent>>,
    audit: Option<Logger>,
}

impl EventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log that mirrors entries into a markdown audit file
    pub fn with_audit_logger(logger: Logger) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            audit: Some(logger),
        }
    }

    /// Append an event stamped with the current time.
    ///
    /// Always succeeds; audit file failures are only reported through tracing.
    pub fn record(
        &self,
        event_type: EventType,
        agent_name: &str,
        data: EventData,
        error: Option<String>,
    ) -> OrchestrationEvent {
        let event = OrchestrationEvent {
            id: uuid::Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            agent_name: agent_name.to_string(),
            data,
            error,
        };

        match &event.error {
            Some(err) => tracing::warn!(
                event_type = %event.event_type,
                agent = %event.agent_name,
                error = %err,
                "orchestration event"
            ),
            None => tracing::debug!(
                event_type = %event.event_type,
                agent = %event.agent_name,
                "orchestration event"
            ),
        }

        if let Some(logger) = &self.audit {
            if let Err(e) = Self::mirror(logger, &event) {
                tracing::warn!(error = %e, "failed to write audit log entry");
            }
        }

        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        event
    }

    fn mirror(logger: &Logger, event: &OrchestrationEvent) -> anyhow::Result<()> {
        match (&event.event_type, &event.data) {
            (EventType::HandoffRequested, EventData::Handoff { source, target, trigger, .. }) => {
                logger.log_handoff("requested", source, target, trigger)
            }
            (EventType::HandoffCompleted, EventData::Handoff { source, target, trigger, .. }) => {
                logger.log_handoff("completed", source, target, trigger)
            }
            (EventType::Escalation, EventData::Escalation(payload)) => logger.log_escalation(
                &event.agent_name,
                &payload.trigger,
                payload.action.as_str(),
                payload.target.as_deref(),
            ),
            (EventType::ToolCall, EventData::ToolCall(call)) => logger.log_tool_call(
                &call.tool_name,
                "",
                event.error.as_deref().unwrap_or("ok"),
                call.success,
            ),
            (EventType::AgentStart, _) => logger.log_agent(&event.agent_name, "Start"),
            (EventType::AgentEnd, _) if event.error.is_none() => {
                logger.log_completion(&format!("Turn completed by {}", event.agent_name))
            }
            _ => {
                let message = event
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} by {}", event.event_type, event.agent_name));
                logger.log_error(&message, None)
            }
        }
    }

    /// Markdown audit logger, if one is attached
    pub fn audit_logger(&self) -> Option<&Logger> {
        self.audit.as_ref()
    }

    /// All events, optionally only those for one agent
    pub fn query(&self, agent_name: Option<&str>) -> Vec<OrchestrationEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|e| agent_name.map_or(true, |name| e.agent_name == name))
            .cloned()
            .collect()
    }

    /// All events of one type
    pub fn query_by_type(&self, event_type: EventType) -> Vec<OrchestrationEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Most recent event, optionally for one agent
    pub fn latest(&self, agent_name: Option<&str>) -> Option<OrchestrationEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .rev()
            .find(|e| agent_name.map_or(true, |name| e.agent_name == name))
            .cloned()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every recorded event
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
