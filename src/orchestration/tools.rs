//! Tool contract, registry and execution ledger

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use super::error::{OrchestrationError, OrchestrationResult};

/// Name, description and JSON schema of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// `{type:"object", properties, required, additionalProperties:false}`
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Check the name and the shape of the parameter schema.
    ///
    /// Individual parameter validation is the tool's own job.
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(OrchestrationError::validation(format!(
                "Invalid tool name '{}': must be non-empty and contain only alphanumeric characters, underscores, or hyphens",
                self.name
            )));
        }

        let schema = self.parameters.as_object().ok_or_else(|| {
            OrchestrationError::validation(format!(
                "Tool '{}' parameters must be a JSON object (schema)",
                self.name
            ))
        })?;

        if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(OrchestrationError::validation(format!(
                "Tool '{}' schema must have type \"object\"",
                self.name
            )));
        }
        if !schema.get("properties").map_or(false, |p| p.is_object()) {
            return Err(OrchestrationError::validation(format!(
                "Tool '{}' schema must declare a 'properties' object",
                self.name
            )));
        }
        if !schema.get("required").map_or(false, |r| r.is_array()) {
            return Err(OrchestrationError::validation(format!(
                "Tool '{}' schema must declare a 'required' array",
                self.name
            )));
        }
        if schema.get("additionalProperties") != Some(&serde_json::Value::Bool(false)) {
            return Err(OrchestrationError::validation(format!(
                "Tool '{}' schema must set additionalProperties to false",
                self.name
            )));
        }

        Ok(())
    }
}

/// Why a tool invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments were not usable
    InvalidArguments,
    /// No tool registered under the requested name
    NotFound,
    /// The tool ran and failed
    Execution,
}

/// Tool-side failure, folded into the transcript by the resolution loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    /// Failure while the tool was running
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Execution,
            message: message.into(),
        }
    }

    /// Arguments rejected
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::InvalidArguments,
            message: message.into(),
        }
    }

    /// No such tool
    pub fn not_found(name: &str) -> Self {
        Self {
            kind: ToolErrorKind::NotFound,
            message: format!("Tool '{}' not found", name),
        }
    }

    /// Convert into the orchestration error for direct callers
    pub fn into_orchestration_error(self, tool: &str) -> OrchestrationError {
        OrchestrationError::ToolExecution {
            tool: tool.to_string(),
            message: self.message,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result of one tool invocation
pub type ToolOutcome = Result<serde_json::Value, ToolError>;

/// Details about the call a tool is serving
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub session_id: String,
    pub agent_name: String,
    pub iteration: u32,
}

/// An external action the reasoning backend can request
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and schema
    fn definition(&self) -> ToolDefinition;

    /// Run the tool with parsed arguments
    async fn execute(&self, input: serde_json::Value, invocation: &ToolInvocation) -> ToolOutcome;
}

/// Thread-safe registry of tools keyed by name.
///
/// Cloning shares the underlying registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool after validating its definition.
    ///
    /// Returns an error if a tool with the same name already exists.
    pub fn register(&self, tool: Arc<dyn Tool>) -> OrchestrationResult<()> {
        let definition = tool.definition();
        definition.validate()?;

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&definition.name) {
            return Err(OrchestrationError::validation(format!(
                "Tool '{}' already registered",
                definition.name
            )));
        }
        tracing::debug!(tool = %definition.name, "tool registered");
        tools.insert(definition.name, tool);
        Ok(())
    }

    /// Find a tool by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Definitions of every registered tool, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut definitions: Vec<ToolDefinition> = tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no tool is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse arguments and run the named tool.
    ///
    /// Every failure, including unknown tools and malformed arguments,
    /// comes back as a [`ToolError`].
    pub async fn invoke(&self, arguments: &str, invocation: &ToolInvocation) -> ToolOutcome {
        let tool = self
            .find(&invocation.tool_name)
            .ok_or_else(|| ToolError::not_found(&invocation.tool_name))?;

        let input: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                ToolError::invalid_arguments(format!(
                    "Arguments for '{}' are not valid JSON: {}",
                    invocation.tool_name, e
                ))
            })?
        };
        if !input.is_object() {
            return Err(ToolError::invalid_arguments(format!(
                "Arguments for '{}' must be a JSON object",
                invocation.tool_name
            )));
        }

        match AssertUnwindSafe(tool.execute(input, invocation))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(tool = %invocation.tool_name, panic = %reason, "tool panicked");
                Err(ToolError::execution(format!(
                    "Tool '{}' panicked: {}",
                    invocation.tool_name, reason
                )))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// Unique ID for this tool call
    pub tool_call_id: String,
    /// Name of the tool that was executed
    pub tool_name: String,
    /// Tool output, or the error message on failure
    pub content: String,
    /// Whether tool execution succeeded
    pub success: bool,
    pub duration_ms: u64,
}

/// Tool coordinator
///
/// Ledger of the tool calls made while resolving one request.
#[derive(Debug, Default)]
pub struct ToolCoordinator {
    execution_history: Vec<ToolExecutionResult>,
}

impl ToolCoordinator {
    /// Create a new tool coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool invocation
    pub fn record_invocation(&mut self, result: ToolExecutionResult) {
        self.execution_history.push(result);
    }

    /// Get total number of tool invocations
    pub fn invocation_count(&self) -> usize {
        self.execution_history.len()
    }

    /// Get successful executions
    pub fn successful_executions(&self) -> Vec<&ToolExecutionResult> {
        self.execution_history.iter().filter(|r| r.success).collect()
    }

    /// Get failed executions
    pub fn failed_executions(&self) -> Vec<&ToolExecutionResult> {
        self.execution_history.iter().filter(|r| !r.success).collect()
    }

    /// Take the recorded history
    pub fn into_history(self) -> Vec<ToolExecutionResult> {
        self.execution_history
    }
}
