//! Validates and executes a single handoff

use std::sync::Arc;

use super::error::{OrchestrationError, OrchestrationResult};
use super::events::{EventData, EventLog, EventType};
use super::session::{HandoffRecord, HandoffRequest, SessionState};
use super::sync::StateSynchronizer;
use crate::config::ScenarioConfig;

/// Agents known to the deployment.
///
/// An empty roster accepts any agent name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scenario {
    agents: Vec<String>,
    initial_agent: Option<String>,
}

impl Scenario {
    pub fn new(agents: Vec<String>, initial_agent: Option<String>) -> Self {
        Self {
            agents,
            initial_agent,
        }
    }

    pub fn from_config(config: &ScenarioConfig) -> Self {
        Self::new(config.agents.clone(), config.initial_agent.clone())
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Configured first agent, else the first listed one
    pub fn initial_agent(&self) -> Option<&str> {
        self.initial_agent
            .as_deref()
            .or_else(|| self.agents.first().map(String::as_str))
    }

    /// Whether `name` may take part in a handoff
    pub fn contains(&self, name: &str) -> bool {
        self.agents.is_empty() || self.agents.iter().any(|a| a == name)
    }

    /// Check a name against the roster
    pub fn check_agent(&self, name: &str) -> OrchestrationResult<()> {
        if name.trim().is_empty() {
            return Err(OrchestrationError::validation("Agent name must not be empty"));
        }
        if !self.contains(name) {
            return Err(OrchestrationError::configuration(format!(
                "Agent '{}' is not part of the scenario",
                name
            )));
        }
        Ok(())
    }
}

/// Runs the handoff sequence against session state and the event log
#[derive(Debug)]
pub struct HandoffCoordinator {
    sessions: Arc<SessionState>,
    events: Arc<EventLog>,
    scenario: Scenario,
    synchronizer: Option<Arc<StateSynchronizer>>,
}

impl HandoffCoordinator {
    /// Coordinator that writes only to session state
    pub fn new(sessions: Arc<SessionState>, events: Arc<EventLog>) -> Self {
        Self {
            sessions,
            events,
            scenario: Scenario::default(),
            synchronizer: None,
        }
    }

    /// Coordinator that commits through the synchronizer so the context
    /// store mirrors every handoff
    pub fn synchronized(synchronizer: Arc<StateSynchronizer>, events: Arc<EventLog>) -> Self {
        Self {
            sessions: Arc::clone(synchronizer.sessions()),
            events,
            scenario: Scenario::default(),
            synchronizer: Some(synchronizer),
        }
    }

    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Hand the session from `request.source_agent` to `request.target_agent`.
    ///
    /// Nothing is mutated or recorded when validation or the legality check
    /// fails. A failed commit records an `error` event for the source.
    pub fn request_handoff(
        &self,
        session_id: &str,
        request: HandoffRequest,
    ) -> OrchestrationResult<HandoffRecord> {
        self.validate(&request)?;

        let source = request.source_agent.clone();
        let target = request.target_agent.clone();

        if !self.sessions.can_handoff_to(session_id, &target) {
            tracing::info!(session_id, from = %source, to = %target, "handoff rejected");
            return Err(OrchestrationError::CircularHandoff { target });
        }

        let data = EventData::Handoff {
            session_id: session_id.to_string(),
            source: source.clone(),
            target: target.clone(),
            trigger: request.trigger.clone(),
        };
        self.events
            .record(EventType::HandoffRequested, &source, data.clone(), None);

        let committed = match &self.synchronizer {
            Some(sync) => sync.sync_handoff(session_id, request),
            None => self.sessions.commit_handoff(session_id, request),
        };

        match committed {
            Ok(record) => {
                self.events
                    .record(EventType::HandoffCompleted, &target, data, None);
                tracing::info!(
                    session_id,
                    from = %source,
                    to = %target,
                    trigger = %record.trigger,
                    "handoff completed"
                );
                Ok(record)
            }
            Err(e) => {
                self.events.record(
                    EventType::Error,
                    &source,
                    EventData::Failure {
                        session_id: Some(session_id.to_string()),
                        stage: "handoff".to_string(),
                    },
                    Some(e.to_string()),
                );
                tracing::error!(session_id, from = %source, to = %target, error = %e, "handoff failed");
                Err(e)
            }
        }
    }

    fn validate(&self, request: &HandoffRequest) -> OrchestrationResult<()> {
        self.scenario.check_agent(&request.source_agent)?;
        self.scenario.check_agent(&request.target_agent)?;
        if request.source_agent == request.target_agent {
            return Err(OrchestrationError::validation(format!(
                "Cannot hand off from '{}' to itself",
                request.source_agent
            )));
        }
        Ok(())
    }
}
