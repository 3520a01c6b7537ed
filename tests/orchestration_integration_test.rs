//! Integration test for the orchestration core
//!
//! Tests the tool-resolution loop and the orchestrator with a mock backend and tools

use anyhow::Result;
use ark::config::ConfigurationLoader;
use ark::orchestration::{
    BackendRequest, BackendResponse, ConversationContextStore, EventLog, EventType,
    OrchestrationError, Orchestrator, ReasoningBackend, Tool, ToolDefinition, ToolError,
    ToolInvocation, ToolOutcome, ToolRegistry, ToolResolutionLoop, TranscriptItem,
};
use ark::orchestration::{EscalationAction, HandoffRequest};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// Mock backend replaying scripted responses
struct MockBackend {
    responses: Arc<Mutex<Vec<BackendResponse>>>,
    requests: Arc<Mutex<Vec<BackendRequest>>>,
}

impl MockBackend {
    fn new(responses: Vec<BackendResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    async fn respond(&self, request: &BackendRequest) -> Result<BackendResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(BackendResponse::text(format!("{} here", request.agent)))
        } else {
            Ok(responses.remove(0))
        }
    }

    fn name(&self) -> &str {
        "MockBackend"
    }
}

// Backend that asks for a tool on every round-trip
struct AlwaysToolBackend {
    calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl ReasoningBackend for AlwaysToolBackend {
    async fn respond(&self, _request: &BackendRequest) -> Result<BackendResponse> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        Ok(BackendResponse::function_call(
            format!("call_{}", *calls),
            "lookup_order",
            r#"{"order_id":"A-1"}"#,
        ))
    }

    fn name(&self) -> &str {
        "AlwaysToolBackend"
    }
}

struct FailingBackend;

#[async_trait]
impl ReasoningBackend for FailingBackend {
    async fn respond(&self, _request: &BackendRequest) -> Result<BackendResponse> {
        Err(anyhow::anyhow!("connection reset"))
    }

    fn name(&self) -> &str {
        "FailingBackend"
    }
}

fn object_schema(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

// Mock tools for testing
struct LookupOrder {
    invocations: Arc<Mutex<Vec<ToolInvocation>>>,
}

impl LookupOrder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Tool for LookupOrder {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "lookup_order",
            "Look up an order by id",
            object_schema(
                serde_json::json!({"order_id": {"type": "string"}}),
                &["order_id"],
            ),
        )
    }

    async fn execute(&self, input: serde_json::Value, invocation: &ToolInvocation) -> ToolOutcome {
        self.invocations.lock().unwrap().push(invocation.clone());
        let order_id = input
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::invalid_arguments("order_id is required"))?;
        Ok(serde_json::json!({"order_id": order_id, "status": "shipped"}))
    }
}

struct RefundTool;

#[async_trait]
impl Tool for RefundTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("issue_refund", "Refund an order", object_schema(serde_json::json!({}), &[]))
    }

    async fn execute(&self, _input: serde_json::Value, _invocation: &ToolInvocation) -> ToolOutcome {
        Err(ToolError::execution("payments service offline"))
    }
}

fn tool_loop(
    backend: Arc<dyn ReasoningBackend>,
    tools: Vec<Arc<dyn Tool>>,
) -> (ToolResolutionLoop, Arc<ConversationContextStore>, Arc<EventLog>) {
    let registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    let contexts = Arc::new(ConversationContextStore::new());
    let events = Arc::new(EventLog::new());
    let runtime = ToolResolutionLoop::new(backend, registry, Arc::clone(&contexts), Arc::clone(&events));
    (runtime, contexts, events)
}

#[tokio::test]
async fn test_loop_answers_on_first_iteration_without_tools() {
    let backend = MockBackend::new(vec![]);
    let (runtime, _, events) = tool_loop(backend.clone(), vec![]);
    let mut request = runtime.request_for("greeter", vec![TranscriptItem::user("hi")]);

    let initial = BackendResponse {
        output: vec![
            ark::orchestration::OutputItem::OutputText { text: "Welcome! ".to_string() },
            ark::orchestration::OutputItem::OutputText { text: "How can I help?".to_string() },
        ],
        error: None,
    };
    let resolution = runtime
        .resolve("s1", &mut request, initial, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resolution.answer, "Welcome! How can I help?");
    assert_eq!(resolution.round_trips, 0);
    assert!(resolution.tool_calls.is_empty());
    assert_eq!(backend.calls(), 0);
    assert!(events.query_by_type(EventType::ToolCall).is_empty());
}

#[tokio::test]
async fn test_loop_stops_after_exactly_max_iterations() {
    let calls = Arc::new(Mutex::new(0));
    let backend = Arc::new(AlwaysToolBackend {
        calls: Arc::clone(&calls),
    });
    let lookup = LookupOrder::new();
    let (runtime, contexts, events) = tool_loop(backend, vec![lookup.clone() as Arc<dyn Tool>]);
    let mut request = runtime.request_for("sales", vec![TranscriptItem::user("where is A-1?")]);

    let initial = BackendResponse::function_call("call_0", "lookup_order", r#"{"order_id":"A-1"}"#);
    let err = runtime
        .resolve("s1", &mut request, initial, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, OrchestrationError::MaxIterationsExceeded { iterations: 5 });
    assert_eq!(*calls.lock().unwrap(), 5);
    assert_eq!(lookup.invocations.lock().unwrap().len(), 5);
    assert_eq!(events.query_by_type(EventType::ToolCall).len(), 5);
    assert_eq!(events.query_by_type(EventType::Error).len(), 1);

    let context = contexts.get("s1").unwrap();
    assert_eq!(context.metadata.tool_call_count, 5);
    assert!(!context.metadata.issue_resolved);
    // user message plus five call/result pairs
    assert_eq!(request.input.len(), 11);
}

#[tokio::test]
async fn test_failing_tool_is_folded_into_transcript() {
    let backend = MockBackend::new(vec![BackendResponse::text("The refund could not be issued.")]);
    let (runtime, contexts, events) = tool_loop(backend.clone(), vec![Arc::new(RefundTool) as Arc<dyn Tool>]);
    let mut request = runtime.request_for("billing", vec![TranscriptItem::user("refund please")]);

    let initial = BackendResponse::function_call("call_9", "issue_refund", "{}");
    let resolution = runtime
        .resolve("s1", &mut request, initial, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resolution.answer, "The refund could not be issued.");
    assert_eq!(resolution.round_trips, 1);
    assert!(!resolution.tool_calls[0].success);
    assert_eq!(backend.calls(), 1);

    assert_eq!(
        request.input[1..],
        [
            TranscriptItem::FunctionCall {
                call_id: "call_9".to_string(),
                name: "issue_refund".to_string(),
                arguments: "{}".to_string(),
            },
            TranscriptItem::FunctionCallOutput {
                call_id: "call_9".to_string(),
                output: "payments service offline".to_string(),
                is_error: true,
            },
        ]
    );

    let sent = backend.requests.lock().unwrap()[0].clone();
    assert_eq!(sent.input.len(), 3);

    let tool_events = events.query_by_type(EventType::ToolCall);
    assert_eq!(tool_events.len(), 1);
    assert_eq!(tool_events[0].error.as_deref(), Some("payments service offline"));

    let context = contexts.get("s1").unwrap();
    assert_eq!(context.metadata.failed_tool_calls, 1);
    assert_eq!(context.metadata.error_count, 1);
    assert!(context.metadata.issue_resolved);
}

#[tokio::test]
async fn test_unknown_tool_and_bad_arguments_do_not_abort() {
    let backend = MockBackend::new(vec![BackendResponse::text("done")]);
    let lookup = LookupOrder::new();
    let (runtime, contexts, _) = tool_loop(backend, vec![lookup.clone() as Arc<dyn Tool>]);
    let mut request = runtime.request_for("sales", Vec::new());

    let initial = BackendResponse {
        output: vec![
            ark::orchestration::OutputItem::FunctionCall {
                call_id: "a".to_string(),
                name: "teleport".to_string(),
                arguments: "{}".to_string(),
            },
            ark::orchestration::OutputItem::FunctionCall {
                call_id: "b".to_string(),
                name: "lookup_order".to_string(),
                arguments: "{not json".to_string(),
            },
            ark::orchestration::OutputItem::FunctionCall {
                call_id: "c".to_string(),
                name: "lookup_order".to_string(),
                arguments: r#"{"order_id":"B-2"}"#.to_string(),
            },
        ],
        error: None,
    };
    let resolution = runtime
        .resolve("s1", &mut request, initial, &CancellationToken::new())
        .await
        .unwrap();

    let outcomes: Vec<bool> = resolution.tool_calls.iter().map(|r| r.success).collect();
    assert_eq!(outcomes, vec![false, false, true]);
    // tool calls run in the order received
    let ids: Vec<&str> = resolution
        .tool_calls
        .iter()
        .map(|r| r.tool_call_id.as_str())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(lookup.invocations.lock().unwrap().len(), 1);
    assert_eq!(contexts.get("s1").unwrap().metadata.failed_tool_calls, 2);
}

#[tokio::test]
async fn test_transport_failure_is_surfaced_and_recorded() {
    let (runtime, contexts, events) = tool_loop(Arc::new(FailingBackend), vec![]);
    let mut request = runtime.request_for("greeter", vec![TranscriptItem::user("hi")]);

    let err = runtime
        .run("s1", &mut request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::Transport { .. }));
    assert!(err.to_string().contains("connection reset"));
    assert!(!err.user_message().contains("connection reset"));

    let errors = events.query_by_type(EventType::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].agent_name, "greeter");
    assert_eq!(contexts.get("s1").unwrap().metadata.error_count, 1);
}

fn orchestrator_config() -> ConfigurationLoader {
    ConfigurationLoader::from_toml_str(
        r#"
[scenario]
agents = ["greeter", "sales", "support", "supervisor"]
initial_agent = "greeter"

[[escalation.rules]]
trigger = "repeated_failures"
action = "handoff"
target = "support"
message = "Moving {session_id} from {agent} to {target}"
when = { failed_tool_calls_at_least = 1 }
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_orchestrator_end_to_end() {
    let backend = MockBackend::new(vec![]);
    let orchestrator = Orchestrator::builder(backend.clone())
        .config(orchestrator_config().config)
        .tool(LookupOrder::new())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    assert_eq!(orchestrator.start_session("S", Some("user-7")).unwrap(), "greeter");

    let turn = orchestrator.handle_turn("S", "hello", &cancel).await.unwrap();
    assert_eq!(turn.agent, "greeter");
    assert_eq!(turn.answer, "greeter here");
    assert!(!turn.escalation.escalated);
    assert!(turn.handoff.is_none());

    let record = orchestrator
        .handoff(
            "S",
            HandoffRequest::new("greeter", "sales").with_trigger("user asked about products"),
        )
        .unwrap();
    assert_eq!(record.target_agent, "sales");

    let state = orchestrator.state("S");
    assert!(state.consistent);
    let session = state.session.unwrap();
    assert_eq!(session.current_agent.as_deref(), Some("sales"));
    assert_eq!(session.previous_agent.as_deref(), Some("greeter"));

    let completed: Vec<_> = orchestrator
        .events()
        .query(Some("sales"))
        .into_iter()
        .filter(|e| e.event_type == EventType::HandoffCompleted)
        .collect();
    assert_eq!(completed.len(), 1);

    // keyword heuristic routes to the supervisor
    let turn = orchestrator
        .handle_turn("S", "I want to speak to a manager", &cancel)
        .await
        .unwrap();
    assert!(turn.escalation.escalated);
    assert_eq!(turn.escalation.action, Some(EscalationAction::Escalate));
    assert_eq!(turn.agent, "supervisor");
    assert_eq!(turn.answer, "supervisor here");
    assert_eq!(turn.handoff.unwrap().source_agent, "sales");

    let events = orchestrator.events();
    assert_eq!(events.query_by_type(EventType::AgentStart).len(), 2);
    assert_eq!(events.query_by_type(EventType::AgentEnd).len(), 2);
    assert_eq!(events.query_by_type(EventType::Escalation).len(), 1);

    let analytics = orchestrator.analytics("S").unwrap();
    assert_eq!(analytics.handoff_count, 2);
    assert!(orchestrator.state("S").consistent);

    let last_request = backend.requests.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last_request.agent, "supervisor");
    assert_eq!(last_request.tools.len(), 1);
    assert!(!last_request.parallel_tool_calls);
}

#[tokio::test]
async fn test_configured_rule_hands_off_after_tool_failure() {
    let backend = MockBackend::new(vec![
        BackendResponse::function_call("call_1", "issue_refund", "{}"),
        BackendResponse::text("Let me look into that."),
    ]);
    let orchestrator = Orchestrator::builder(backend)
        .config(orchestrator_config().config)
        .tool(Arc::new(RefundTool))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    let turn = orchestrator
        .handle_turn("S2", "refund order A-1", &cancel)
        .await
        .unwrap();
    assert_eq!(turn.agent, "greeter");
    assert_eq!(turn.answer, "Let me look into that.");

    let turn = orchestrator
        .handle_turn("S2", "any news?", &cancel)
        .await
        .unwrap();
    assert_eq!(turn.escalation.trigger.as_deref(), Some("repeated_failures"));
    assert_eq!(turn.escalation.action, Some(EscalationAction::Handoff));
    assert_eq!(
        turn.escalation.message.as_deref(),
        Some("Moving S2 from greeter to support")
    );
    assert_eq!(turn.agent, "support");
    assert_eq!(turn.answer, "support here");
}

#[tokio::test]
async fn test_cancelled_turn_records_agent_end_with_error() {
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator.handle_turn("S3", "hello", &cancel).await.unwrap_err();
    assert_eq!(err, OrchestrationError::Cancelled);

    let end = orchestrator.events().query_by_type(EventType::AgentEnd);
    assert_eq!(end.len(), 1);
    assert!(end[0].error.is_some());
    // the user message stays recorded
    assert_eq!(orchestrator.contexts().get("S3").unwrap().conversation_history.len(), 1);
}

#[tokio::test]
async fn test_reset_drops_everything() {
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    orchestrator.handle_turn("A", "hello", &cancel).await.unwrap();
    orchestrator.handle_turn("B", "hello", &cancel).await.unwrap();

    orchestrator.reset_session("A");
    assert!(orchestrator.state("A").session.is_none());
    assert!(orchestrator.state("B").session.is_some());

    orchestrator.reset();
    assert!(orchestrator.events().is_empty());
    assert!(orchestrator.contexts().is_empty());
    assert!(orchestrator.sessions().session_ids().is_empty());
}

#[test]
fn test_builder_rejects_invalid_setup() {
    let mut config = orchestrator_config().config;
    config.tool_loop.max_iterations = 0;
    let err = Orchestrator::builder(MockBackend::new(vec![]))
        .config(config)
        .build()
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Configuration { .. }));

    let err = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .tool(Arc::new(RefundTool))
        .tool(Arc::new(RefundTool))
        .build()
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation { .. }));
}

#[tokio::test]
async fn test_audit_log_mirrors_turns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.md");
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .audit_logger(ark::observability::Logger::new(Some(&path), None).unwrap())
        .build()
        .unwrap();

    orchestrator.start_session("S4", Some("user-1")).unwrap();
    orchestrator
        .handle_turn("S4", "hello", &CancellationToken::new())
        .await
        .unwrap();
    orchestrator
        .handoff("S4", HandoffRequest::new("greeter", "sales"))
        .unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("## Session Started"));
    assert!(content.contains("**Session:** S4"));
    assert!(content.contains("Turn completed by greeter"));
    assert!(content.contains("### Handoff completed"));
}

#[tokio::test]
async fn test_expired_session_leaves_both_stores() {
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .build()
        .unwrap();

    orchestrator.start_session("S5", None).unwrap();
    orchestrator
        .handoff("S5", HandoffRequest::new("greeter", "sales"))
        .unwrap();

    // age the context past the 24h expiry
    let mut export = orchestrator.contexts().export_context("S5").unwrap();
    export.context.metadata.last_activity = chrono::Utc::now() - chrono::Duration::hours(25);
    orchestrator.contexts().import_context(export).unwrap();

    assert_eq!(orchestrator.cleanup_expired(), 1);
    let state = orchestrator.state("S5");
    assert!(state.session.is_none());
    assert!(state.context.is_none());
    assert!(state.consistent);

    orchestrator
        .handoff("S5", HandoffRequest::new("sales", "support"))
        .unwrap();
    let state = orchestrator.state("S5");
    assert!(state.consistent);
    assert_eq!(state.session.unwrap().handoff_history.len(), 1);
    assert_eq!(state.context.unwrap().metadata.handoff_count, 1);
}

#[test]
fn test_start_session_is_idempotent() {
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .config(orchestrator_config().config)
        .build()
        .unwrap();

    assert_eq!(orchestrator.start_session("S6", None).unwrap(), "greeter");
    assert_eq!(orchestrator.start_session("S6", Some("user-9")).unwrap(), "greeter");

    let session = orchestrator.sessions().peek("S6").unwrap();
    assert_eq!(session.current_agent.as_deref(), Some("greeter"));
    assert!(session.previous_agent.is_none());
    assert_eq!(
        orchestrator.contexts().get("S6").unwrap().user_id.as_deref(),
        Some("user-9")
    );
    orchestrator
        .handoff("S6", HandoffRequest::new("greeter", "sales"))
        .unwrap();
    // no phantom bounce: greeter is the only previous agent now
    assert_eq!(
        orchestrator.sessions().peek("S6").unwrap().previous_agent.as_deref(),
        Some("greeter")
    );
}

#[tokio::test]
async fn test_turn_without_any_agent_configured() {
    let orchestrator = Orchestrator::builder(MockBackend::new(vec![]))
        .build()
        .unwrap();

    let err = orchestrator
        .handle_turn("S7", "hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Configuration { .. }));
    assert!(orchestrator.events().is_empty());
    assert!(orchestrator.state("S7").session.is_none());
}
