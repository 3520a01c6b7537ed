//! Tool-resolution loop - bounded backend/tool iteration

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::{ConversationContextStore, Message, MessageRole};
use super::error::{OrchestrationError, OrchestrationResult};
use super::events::{EventData, EventLog, EventType};
use super::tools::{ToolCoordinator, ToolDefinition, ToolExecutionResult, ToolInvocation, ToolRegistry};
use crate::config::ToolLoopConfig;

/// One entry of the outgoing transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptItem {
    Message {
        role: MessageRole,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
        is_error: bool,
    },
}

impl TranscriptItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Request body sent to the reasoning backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Agent the request is made for
    pub agent: String,
    pub input: Vec<TranscriptItem>,
    pub tools: Vec<ToolDefinition>,
    /// Always false; tool calls are executed one at a time
    pub parallel_tool_calls: bool,
}

/// Output item of a backend response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    OutputText {
        text: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
}

/// Response of the reasoning backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    #[serde(default)]
    pub output: Vec<OutputItem>,
    /// Transport-level error reported inside an otherwise delivered response
    #[serde(default)]
    pub error: Option<String>,
}

impl BackendResponse {
    /// Plain-text answer
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: vec![OutputItem::OutputText { text: text.into() }],
            error: None,
        }
    }

    /// Single tool call request
    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            output: vec![OutputItem::FunctionCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            }],
            error: None,
        }
    }

    /// Requested tool calls in the order received
    pub fn function_calls(&self) -> Vec<(&str, &str, &str)> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some((call_id.as_str(), name.as_str(), arguments.as_str())),
                OutputItem::OutputText { .. } => None,
            })
            .collect()
    }

    /// All text segments concatenated in order
    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::OutputText { text } => Some(text.as_str()),
                OutputItem::FunctionCall { .. } => None,
            })
            .collect()
    }
}

/// The network round-trip to the reasoning backend
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Send the request and wait for the response
    async fn respond(&self, request: &BackendRequest) -> Result<BackendResponse>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Tool loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum number of re-issued round-trips
    pub max_iterations: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

impl From<&ToolLoopConfig> for RuntimeConfig {
    fn from(config: &ToolLoopConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
        }
    }
}

/// Final answer of a resolved request
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub answer: String,
    /// Round-trips issued after the initial response
    pub round_trips: u32,
    pub tool_calls: Vec<ToolExecutionResult>,
}

/// Bounded request/execute/re-request cycle
pub struct ToolResolutionLoop {
    config: RuntimeConfig,
    backend: Arc<dyn ReasoningBackend>,
    tools: ToolRegistry,
    contexts: Arc<ConversationContextStore>,
    events: Arc<EventLog>,
}

impl ToolResolutionLoop {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        tools: ToolRegistry,
        contexts: Arc<ConversationContextStore>,
        events: Arc<EventLog>,
    ) -> Self {
        Self::with_config(RuntimeConfig::default(), backend, tools, contexts, events)
    }

    pub fn with_config(
        config: RuntimeConfig,
        backend: Arc<dyn ReasoningBackend>,
        tools: ToolRegistry,
        contexts: Arc<ConversationContextStore>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            backend,
            tools,
            contexts,
            events,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Request body for `agent` carrying every registered tool
    pub fn request_for(&self, agent: &str, input: Vec<TranscriptItem>) -> BackendRequest {
        BackendRequest {
            agent: agent.to_string(),
            input,
            tools: self.tools.definitions(),
            parallel_tool_calls: false,
        }
    }

    /// Issue the initial round-trip, then resolve.
    pub async fn run(
        &self,
        session_id: &str,
        request: &mut BackendRequest,
        cancel: &CancellationToken,
    ) -> OrchestrationResult<Resolution> {
        let initial = self.round_trip(session_id, request, cancel).await?;
        self.resolve(session_id, request, initial, cancel).await
    }

    /// Resolve every requested tool call into a final answer.
    ///
    /// Starting from `initial`, at most `max_iterations` further
    /// round-trips are issued. Tool failures are folded into the transcript
    /// and never abort the loop. Transcript entries appended before a
    /// failure or cancellation stay in `request`.
    pub async fn resolve(
        &self,
        session_id: &str,
        request: &mut BackendRequest,
        initial: BackendResponse,
        cancel: &CancellationToken,
    ) -> OrchestrationResult<Resolution> {
        let agent = request.agent.clone();
        let mut ledger = ToolCoordinator::new();
        let mut response = initial;
        let mut round_trips = 0u32;

        loop {
            if let Some(message) = response.error.take() {
                return Err(self.transport_failure(session_id, &agent, message));
            }

            let calls: Vec<(String, String, String)> = response
                .function_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.to_string()))
                .collect();

            if calls.is_empty() {
                let answer = response.output_text();
                self.contexts.mark_resolved(session_id);
                self.contexts
                    .add_message(session_id, Message::assistant(&agent, answer.clone()));
                tracing::info!(
                    session_id,
                    agent = %agent,
                    round_trips,
                    tool_calls = ledger.invocation_count(),
                    succeeded = ledger.successful_executions().len(),
                    failed = ledger.failed_executions().len(),
                    "request resolved"
                );
                return Ok(Resolution {
                    answer,
                    round_trips,
                    tool_calls: ledger.into_history(),
                });
            }

            if round_trips >= self.config.max_iterations {
                let error = OrchestrationError::MaxIterationsExceeded {
                    iterations: self.config.max_iterations,
                };
                self.events.record(
                    EventType::Error,
                    &agent,
                    EventData::Failure {
                        session_id: Some(session_id.to_string()),
                        stage: "tool_loop".to_string(),
                    },
                    Some(error.to_string()),
                );
                self.contexts.record_error(session_id);
                tracing::warn!(session_id, agent = %agent, round_trips, "tool loop bound reached");
                return Err(error);
            }
            round_trips += 1;

            for (call_id, name, arguments) in calls {
                let result = self
                    .execute_call(session_id, &agent, round_trips, &call_id, &name, &arguments)
                    .await;
                request.input.push(TranscriptItem::FunctionCall {
                    call_id: call_id.clone(),
                    name,
                    arguments,
                });
                request.input.push(TranscriptItem::FunctionCallOutput {
                    call_id,
                    output: result.content.clone(),
                    is_error: !result.success,
                });
                ledger.record_invocation(result);
            }

            response = self.round_trip(session_id, request, cancel).await?;
        }
    }

    async fn execute_call(
        &self,
        session_id: &str,
        agent: &str,
        iteration: u32,
        call_id: &str,
        name: &str,
        arguments: &str,
    ) -> ToolExecutionResult {
        let invocation = ToolInvocation {
            call_id: call_id.to_string(),
            tool_name: name.to_string(),
            session_id: session_id.to_string(),
            agent_name: agent.to_string(),
            iteration,
        };

        let started = Instant::now();
        let outcome = self.tools.invoke(arguments, &invocation).await;
        let elapsed = started.elapsed();

        let (content, error) = match outcome {
            Ok(serde_json::Value::String(text)) => (text, None),
            Ok(value) => (value.to_string(), None),
            Err(e) => {
                tracing::warn!(
                    session_id,
                    agent,
                    tool = name,
                    kind = ?e.kind,
                    error = %e,
                    "tool call failed"
                );
                (e.message.clone(), Some(e.message))
            }
        };
        let success = error.is_none();

        let record = self
            .contexts
            .record_tool_call(session_id, name, success, Some(elapsed));
        self.events
            .record(EventType::ToolCall, agent, EventData::ToolCall(record), error);
        tracing::debug!(session_id, agent, tool = name, iteration, success, "tool call");

        ToolExecutionResult {
            tool_call_id: call_id.to_string(),
            tool_name: name.to_string(),
            content,
            success,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    async fn round_trip(
        &self,
        session_id: &str,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> OrchestrationResult<BackendResponse> {
        if cancel.is_cancelled() {
            tracing::info!(session_id, agent = %request.agent, "request cancelled");
            return Err(OrchestrationError::Cancelled);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(session_id, agent = %request.agent, "request cancelled in flight");
                return Err(OrchestrationError::Cancelled);
            }
            outcome = self.backend.respond(request) => outcome,
        };

        outcome.map_err(|e| {
            self.transport_failure(session_id, &request.agent, format!("{:#}", e))
        })
    }

    fn transport_failure(&self, session_id: &str, agent: &str, message: String) -> OrchestrationError {
        tracing::error!(
            session_id,
            agent,
            backend = self.backend.name(),
            error = %message,
            "backend round-trip failed"
        );
        self.events.record(
            EventType::Error,
            agent,
            EventData::Failure {
                session_id: Some(session_id.to_string()),
                stage: "backend".to_string(),
            },
            Some(message.clone()),
        );
        self.contexts.record_error(session_id);
        OrchestrationError::transport(message)
    }
}

impl std::fmt::Debug for ToolResolutionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolResolutionLoop")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("tools", &self.tools)
            .finish()
    }
}
