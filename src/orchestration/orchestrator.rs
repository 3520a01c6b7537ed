//! Orchestrator facade
//!
//! Owns one instance of every component, constructed once and shared by
//! reference. A conversation turn flows through it as
//!
//! 1. record `agent-start` and the user message
//! 2. evaluate escalation and hand off when a target is returned
//! 3. send the transcript to the backend and resolve tool calls
//! 4. record `agent-end`
//!
//! # Example
//!
//! ```ignore
//! use ark::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(backend)
//!     .config(ConfigurationLoader::new(None)?.config)
//!     .tool(Arc::new(LookupOrder))
//!     .build()?;
//!
//! orchestrator.start_session("s1", Some("user-42"))?;
//! let turn = orchestrator
//!     .handle_turn("s1", "where is my order?", &CancellationToken::new())
//!     .await?;
//! println!("{}: {}", turn.agent, turn.answer);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::context::{ConversationContextStore, Message, SessionAnalytics};
use super::error::{OrchestrationError, OrchestrationResult};
use super::escalation::{EscalationEngine, EscalationOutcome, EscalationRule, RoutingClassifier};
use super::events::{EventData, EventLog, EventType};
use super::handoff::{HandoffCoordinator, Scenario};
use super::runtime::{ReasoningBackend, RuntimeConfig, ToolResolutionLoop, TranscriptItem};
use super::session::{HandoffPolicy, HandoffRecord, HandoffRequest, SessionState};
use super::sync::{StateSynchronizer, SynchronizedState};
use super::tools::{Tool, ToolRegistry};
use crate::config::{ConfigurationLoader, EnvironmentLoader, OrchestrationConfig};
use crate::observability::Logger;

/// Result of one conversation turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Agent that produced the answer
    pub agent: String,
    pub answer: String,
    pub escalation: EscalationOutcome,
    /// Handoff performed because of the escalation, if any
    pub handoff: Option<HandoffRecord>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    backend: Arc<dyn ReasoningBackend>,
    config: OrchestrationConfig,
    tools: Vec<Arc<dyn Tool>>,
    rules: Vec<EscalationRule>,
    classifier: Option<RoutingClassifier>,
    audit_logger: Option<Logger>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply `ARK_LOG_LEVEL` and `ARK_LOG_FILE` overrides
    pub fn environment(mut self, env: &EnvironmentLoader) -> Self {
        if let Some(level) = env.log_level() {
            self.config.logging.log_level = level;
        }
        if let Some(file) = env.log_file() {
            self.config.logging.log_file = Some(file);
        }
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Programmatic rule; evaluated before rules from configuration
    pub fn rule(mut self, rule: EscalationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn classifier(mut self, classifier: RoutingClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Use this audit logger instead of `logging.log_file`
    pub fn audit_logger(mut self, logger: Logger) -> Self {
        self.audit_logger = Some(logger);
        self
    }

    /// Validate configuration, register tools and wire every component.
    pub fn build(self) -> OrchestrationResult<Orchestrator> {
        let loader = ConfigurationLoader::from_config(self.config)
            .map_err(|e| OrchestrationError::configuration(format!("{:#}", e)))?;

        let audit = match self.audit_logger {
            Some(logger) => Some(logger),
            None => match loader
                .log_file_path()
                .map_err(|e| OrchestrationError::configuration(format!("{:#}", e)))?
            {
                Some(path) => Some(
                    Logger::new(Some(&path), Some(&loader.config.logging.log_level))
                        .map_err(|e| OrchestrationError::configuration(format!("{:#}", e)))?,
                ),
                None => None,
            },
        };
        let config = loader.config;

        let events = Arc::new(match audit {
            Some(logger) => EventLog::with_audit_logger(logger),
            None => EventLog::new(),
        });
        let sessions = Arc::new(SessionState::with_policy(HandoffPolicy::from(&config.session)));
        let contexts = Arc::new(ConversationContextStore::from_config(&config.context));
        let synchronizer = Arc::new(StateSynchronizer::new(
            Arc::clone(&sessions),
            Arc::clone(&contexts),
        ));

        let scenario = Scenario::from_config(&config.scenario);
        let handoffs = HandoffCoordinator::synchronized(Arc::clone(&synchronizer), Arc::clone(&events))
            .with_scenario(scenario);

        let configured = EscalationEngine::from_config(&config.escalation, Arc::clone(&events))?;
        let mut rules = self.rules;
        rules.extend(configured.rules().iter().cloned());
        let mut escalation = EscalationEngine::new(Arc::clone(&events))
            .with_rules(rules)
            .with_keywords(config.escalation.trigger_keywords.clone())
            .with_supervisor_agent(&config.escalation.supervisor_agent);
        if let Some(classifier) = self.classifier {
            escalation = escalation.with_classifier(classifier);
        }

        let registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool)?;
        }

        let tool_loop = ToolResolutionLoop::with_config(
            RuntimeConfig::from(&config.tool_loop),
            self.backend,
            registry,
            Arc::clone(&contexts),
            Arc::clone(&events),
        );

        tracing::info!(
            agents = config.scenario.agents.len(),
            tools = tool_loop.tools().len(),
            rules = escalation.rules().len(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            events,
            sessions,
            contexts,
            synchronizer,
            escalation,
            handoffs,
            tool_loop,
        })
    }
}

/// Explicit service object owning the orchestration core
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestrationConfig,
    events: Arc<EventLog>,
    sessions: Arc<SessionState>,
    contexts: Arc<ConversationContextStore>,
    synchronizer: Arc<StateSynchronizer>,
    escalation: EscalationEngine,
    handoffs: HandoffCoordinator,
    tool_loop: ToolResolutionLoop,
}

impl Orchestrator {
    pub fn builder(backend: Arc<dyn ReasoningBackend>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            backend,
            config: OrchestrationConfig::default(),
            tools: Vec::new(),
            rules: Vec::new(),
            classifier: None,
            audit_logger: None,
        }
    }

    /// Assign the scenario's initial agent to a new session.
    ///
    /// Returns the agent now in charge. A session that already has an agent
    /// keeps it. Fails with `Configuration` when the scenario names no agent
    /// (neither `initial_agent` nor any entry in `agents`).
    pub fn start_session(&self, session_id: &str, user_id: Option<&str>) -> OrchestrationResult<String> {
        if session_id.trim().is_empty() {
            return Err(OrchestrationError::validation("Session id must not be empty"));
        }
        if let Some(agent) = self.sessions.peek(session_id).and_then(|s| s.current_agent) {
            self.synchronizer.start_session(session_id, &agent, user_id)?;
            return Ok(agent);
        }
        let agent = self
            .handoffs
            .scenario()
            .initial_agent()
            .map(str::to_string)
            .ok_or_else(|| OrchestrationError::configuration("No initial agent configured"))?;

        self.synchronizer.start_session(session_id, &agent, user_id)?;
        if let Some(logger) = self.events.audit_logger() {
            let mut details = BTreeMap::new();
            details.insert("agent".to_string(), serde_json::json!(agent));
            details.insert("user".to_string(), serde_json::json!(user_id));
            if let Err(e) = logger.log_session_start(session_id, &details) {
                tracing::warn!(session_id, error = %e, "failed to write audit log entry");
            }
        }
        tracing::info!(session_id, agent = %agent, "session started");
        Ok(agent)
    }

    /// Direct handoff outside of a turn
    pub fn handoff(&self, session_id: &str, request: HandoffRequest) -> OrchestrationResult<HandoffRecord> {
        self.handoffs.request_handoff(session_id, request)
    }

    /// Run one user turn through escalation, handoff and the tool loop.
    ///
    /// A session without an agent is started first, so a scenario with no
    /// agents fails here with `Configuration` before anything is recorded.
    pub async fn handle_turn(
        &self,
        session_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> OrchestrationResult<TurnOutcome> {
        let mut agent = match self.sessions.peek(session_id).and_then(|s| s.current_agent) {
            Some(agent) => agent,
            None => self.start_session(session_id, None)?,
        };

        self.events.record(
            EventType::AgentStart,
            &agent,
            EventData::Turn {
                session_id: session_id.to_string(),
                message: Some(message.to_string()),
            },
            None,
        );
        self.contexts
            .add_message(session_id, Message::user(message).with_agent(&agent));

        let context = self.contexts.get_or_create(session_id, None);
        let escalation = self.escalation.handle_escalation(message, &context, &agent);

        let mut handoff = None;
        if let Some(target) = escalation.target.as_deref().filter(|t| *t != agent) {
            let trigger = escalation.trigger.as_deref().unwrap_or("escalation");
            let request = HandoffRequest::new(agent.as_str(), target).with_trigger(trigger);
            match self.handoffs.request_handoff(session_id, request) {
                Ok(record) => {
                    agent = record.target_agent.clone();
                    handoff = Some(record);
                }
                Err(e) => tracing::warn!(
                    session_id,
                    agent = %agent,
                    to = target,
                    error = %e,
                    "escalation handoff not applied"
                ),
            }
        }

        let transcript = self
            .contexts
            .get(session_id)
            .map(|c| {
                c.conversation_history
                    .into_iter()
                    .map(|m| TranscriptItem::Message {
                        role: m.role,
                        content: m.content,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut request = self.tool_loop.request_for(&agent, transcript);

        let resolution = self.tool_loop.run(session_id, &mut request, cancel).await;
        let turn = EventData::Turn {
            session_id: session_id.to_string(),
            message: None,
        };
        match resolution {
            Ok(resolution) => {
                self.events.record(EventType::AgentEnd, &agent, turn, None);
                Ok(TurnOutcome {
                    agent,
                    answer: resolution.answer,
                    escalation,
                    handoff,
                })
            }
            Err(e) => {
                self.events
                    .record(EventType::AgentEnd, &agent, turn, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Clear session state and context for one session
    pub fn reset_session(&self, session_id: &str) {
        self.synchronizer.reset_state(session_id);
    }

    /// Drop every session, context and event
    pub fn reset(&self) {
        self.sessions.reset_all();
        self.contexts.clear();
        self.events.clear();
        tracing::info!("orchestrator reset");
    }

    /// Remove idle sessions from both stores; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        self.synchronizer.cleanup_expired().len()
    }

    pub fn analytics(&self, session_id: &str) -> Option<SessionAnalytics> {
        self.contexts.get_analytics(session_id)
    }

    pub fn state(&self, session_id: &str) -> SynchronizedState {
        self.synchronizer.get_synchronized_state(session_id)
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionState> {
        &self.sessions
    }

    pub fn contexts(&self) -> &Arc<ConversationContextStore> {
        &self.contexts
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    pub fn escalation(&self) -> &EscalationEngine {
        &self.escalation
    }

    pub fn tool_loop(&self) -> &ToolResolutionLoop {
        &self.tool_loop
    }
}
