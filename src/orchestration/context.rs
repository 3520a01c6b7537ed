//! Conversation context store
//!
//! Holds, per session, the message history, shared variables and counters
//! that follow a conversation across handoffs. Each mutation stamps
//! `last_activity` and pushes a deep-copied snapshot into a bounded history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use super::error::{OrchestrationError, OrchestrationResult};
use super::session::ContextValue;
use crate::config::ContextConfig;

/// Version of the [`ContextExport`] layout
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

const TOOL_CALLS_KEY: &str = "toolCalls";
const AGENT_TRANSITION_KEY: &str = "agentTransition";
const MESSAGE_COUNT_CAP: u32 = 20;

const POSITIVE_KEYWORDS: [&str; 8] = [
    "thank",
    "great",
    "perfect",
    "awesome",
    "helpful",
    "solved",
    "excellent",
    "appreciate",
];

const NEGATIVE_KEYWORDS: [&str; 8] = [
    "frustrat",
    "angry",
    "useless",
    "terrible",
    "not working",
    "worst",
    "annoy",
    "ridiculous",
];

/// Metadata field names owned by the store; callers cannot overwrite them
const RESERVED_FIELDS: [&str; 9] = [
    "messageCount",
    "handoffCount",
    "toolCallCount",
    "errorCount",
    "failedToolCalls",
    "createdAt",
    "lastActivity",
    "issueResolved",
    "completionTime",
];

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Agent that produced or received the message
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Message stamped now
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            agent: None,
            timestamp: Utc::now(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Assistant message attributed to an agent
    pub fn assistant(agent: &str, content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content).with_agent(agent)
    }

    /// Attribute the message to an agent
    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }
}

/// One executed tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Counters and timestamps of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    pub message_count: u32,
    pub handoff_count: u32,
    pub tool_call_count: u32,
    pub error_count: u32,
    pub failed_tool_calls: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub issue_resolved: bool,
    pub completion_time: Option<DateTime<Utc>>,
    pub current_agent: Option<String>,
    /// Free-form fields supplied through [`ContextUpdate`]
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ContextMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            message_count: 0,
            handoff_count: 0,
            tool_call_count: 0,
            error_count: 0,
            failed_tool_calls: 0,
            created_at: now,
            last_activity: now,
            issue_resolved: false,
            completion_time: None,
            current_agent: None,
            fields: BTreeMap::new(),
        }
    }
}

/// Everything known about one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub user_id: Option<String>,
    pub conversation_history: Vec<Message>,
    pub shared_variables: HashMap<String, ContextValue>,
    pub metadata: ContextMetadata,
}

impl ConversationContext {
    /// Empty context created now
    pub fn new(session_id: impl Into<String>, user_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.map(str::to_string),
            conversation_history: Vec::new(),
            shared_variables: HashMap::new(),
            metadata: ContextMetadata::new(Utc::now()),
        }
    }

    /// Most recent user message
    pub fn last_user_message(&self) -> Option<&Message> {
        self.conversation_history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }

    /// Shared variable value, if set
    pub fn variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.shared_variables.get(key).map(|v| &v.value)
    }
}

/// Partial update applied by [`ConversationContextStore::update`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub user_id: Option<String>,
    /// Sets the current agent without counting a handoff
    pub current_agent: Option<String>,
    pub issue_resolved: Option<bool>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ContextUpdate {
    fn validate(&self) -> OrchestrationResult<()> {
        for key in self.fields.keys() {
            if key.trim().is_empty() {
                return Err(OrchestrationError::validation(
                    "metadata field names must not be empty",
                ));
            }
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(OrchestrationError::validation(format!(
                    "metadata field '{}' is managed by the context store",
                    key
                )));
            }
        }
        if matches!(&self.current_agent, Some(agent) if agent.trim().is_empty()) {
            return Err(OrchestrationError::validation("agent name must not be empty"));
        }
        Ok(())
    }
}

/// Point-in-time copy of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub taken_at: DateTime<Utc>,
    pub context: ConversationContext,
}

/// Versioned plain-data export of one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextExport {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub context: ConversationContext,
}

/// Keyword-based satisfaction signals found in user messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatisfactionIndicators {
    pub positive_signals: u32,
    pub negative_signals: u32,
    /// From -1.0 (all negative) to 1.0 (all positive); 0.0 without signals
    pub score: f64,
}

/// Derived, read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnalytics {
    pub session_id: String,
    pub duration_ms: i64,
    pub message_count: u32,
    pub handoff_count: u32,
    pub tool_call_count: u32,
    pub error_count: u32,
    /// Share of successful tool calls; 1.0 when no tool ran
    pub tool_success_rate: f64,
    /// Heuristic 0-100
    pub complexity_score: u8,
    pub satisfaction: SatisfactionIndicators,
    pub issue_resolved: bool,
    pub current_agent: Option<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    contexts: HashMap<String, ConversationContext>,
    snapshots: HashMap<String, VecDeque<ContextSnapshot>>,
}

impl StoreInner {
    fn push_snapshot(&mut self, session_id: &str, max_snapshots: usize) {
        let Some(context) = self.contexts.get(session_id) else {
            return;
        };
        let history = self.snapshots.entry(session_id.to_string()).or_default();
        history.push_back(ContextSnapshot {
            taken_at: Utc::now(),
            context: context.clone(),
        });
        while history.len() > max_snapshots {
            history.pop_front();
        }
    }
}

/// Store of conversation contexts keyed by session id
#[derive(Debug)]
pub struct ConversationContextStore {
    inner: RwLock<StoreInner>,
    expiry: Duration,
    max_snapshots: usize,
}

impl Default for ConversationContextStore {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl ConversationContextStore {
    /// Store with a 24h expiry and 50 snapshots per session
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with explicit limits
    pub fn with_limits(expiry: Duration, max_snapshots: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            expiry,
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Store configured from the `[context]` section
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::with_limits(
            Duration::hours(config.expiry_hours as i64),
            config.max_snapshots,
        )
    }

    /// Idle time after which a context is swept
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Apply `f` to the (lazily created) context, stamp it and snapshot it.
    fn mutate<R>(&self, session_id: &str, f: impl FnOnce(&mut ConversationContext) -> R) -> R {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let context = inner
            .contexts
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationContext::new(session_id, None));
        let result = f(context);
        context.metadata.last_activity = Utc::now();
        inner.push_snapshot(session_id, self.max_snapshots);
        result
    }

    /// Context for the session, creating it if needed
    pub fn get_or_create(&self, session_id: &str, user_id: Option<&str>) -> ConversationContext {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.contexts.contains_key(session_id) {
            tracing::debug!(session_id, "creating conversation context");
            inner.contexts.insert(
                session_id.to_string(),
                ConversationContext::new(session_id, user_id),
            );
            inner.push_snapshot(session_id, self.max_snapshots);
        } else if let Some(user) = user_id {
            if let Some(context) = inner.contexts.get_mut(session_id) {
                if context.user_id.is_none() {
                    context.user_id = Some(user.to_string());
                    context.metadata.last_activity = Utc::now();
                }
            }
        }
        inner
            .contexts
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| ConversationContext::new(session_id, user_id))
    }

    /// Context for the session, if it exists
    pub fn get(&self, session_id: &str) -> Option<ConversationContext> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contexts
            .get(session_id)
            .cloned()
    }

    /// Apply a validated partial update
    pub fn update(
        &self,
        session_id: &str,
        update: ContextUpdate,
    ) -> OrchestrationResult<ConversationContext> {
        update.validate()?;
        Ok(self.mutate(session_id, |context| {
            if let Some(user_id) = update.user_id {
                context.user_id = Some(user_id);
            }
            if let Some(agent) = update.current_agent {
                context.metadata.current_agent = Some(agent);
            }
            if let Some(resolved) = update.issue_resolved {
                context.metadata.issue_resolved = resolved;
            }
            context.metadata.fields.extend(update.fields);
            context.clone()
        }))
    }

    /// Append a message to the history
    pub fn add_message(&self, session_id: &str, message: Message) {
        self.mutate(session_id, |context| {
            context.conversation_history.push(message);
            context.metadata.message_count += 1;
        });
    }

    /// Set a shared variable, overwriting by key
    pub fn set_shared_variable(&self, session_id: &str, key: &str, value: serde_json::Value) {
        self.mutate(session_id, |context| {
            context
                .shared_variables
                .insert(key.to_string(), ContextValue::new(value));
        });
    }

    /// Read a shared variable
    pub fn get_shared_variable(&self, session_id: &str, key: &str) -> Option<ContextValue> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contexts
            .get(session_id)
            .and_then(|c| c.shared_variables.get(key).cloned())
    }

    /// Mirror an agent change.
    ///
    /// When the agent actually changed, the handoff counter is incremented
    /// and an `agentTransition` breadcrumb is written. Returns whether it changed.
    pub fn set_current_agent(&self, session_id: &str, agent: &str) -> bool {
        self.mutate(session_id, |context| {
            if context.metadata.current_agent.as_deref() == Some(agent) {
                return false;
            }
            let from = context.metadata.current_agent.replace(agent.to_string());
            context.metadata.handoff_count += 1;
            context.shared_variables.insert(
                AGENT_TRANSITION_KEY.to_string(),
                ContextValue::new(serde_json::json!({
                    "from": from,
                    "to": agent,
                    "at": Utc::now().to_rfc3339(),
                })),
            );
            true
        })
    }

    /// Count a tool call and append it to the `toolCalls` variable
    pub fn record_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        success: bool,
        duration: Option<std::time::Duration>,
    ) -> ToolCallRecord {
        let record = ToolCallRecord {
            tool_name: tool_name.to_string(),
            success,
            duration_ms: duration.map(|d| d.as_millis() as u64),
            timestamp: Utc::now(),
        };

        let entry = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        self.mutate(session_id, |context| {
            context.metadata.tool_call_count += 1;
            if !success {
                context.metadata.failed_tool_calls += 1;
                context.metadata.error_count += 1;
            }

            let mut calls = match context.shared_variables.get(TOOL_CALLS_KEY) {
                Some(ContextValue {
                    value: serde_json::Value::Array(items),
                    ..
                }) => items.clone(),
                _ => Vec::new(),
            };
            calls.push(entry);
            context.shared_variables.insert(
                TOOL_CALLS_KEY.to_string(),
                ContextValue::new(serde_json::Value::Array(calls)),
            );
        });
        record
    }

    /// Count a non-tool failure
    pub fn record_error(&self, session_id: &str) {
        self.mutate(session_id, |context| context.metadata.error_count += 1);
    }

    /// Mark the issue resolved and stamp the completion time
    pub fn mark_resolved(&self, session_id: &str) {
        self.mutate(session_id, |context| {
            context.metadata.issue_resolved = true;
            context.metadata.completion_time = Some(Utc::now());
        });
    }

    /// Derived analytics for the session
    pub fn get_analytics(&self, session_id: &str) -> Option<SessionAnalytics> {
        let context = self.get(session_id)?;
        let meta = &context.metadata;

        let duration_ms = (meta.last_activity - meta.created_at).num_milliseconds();
        let tool_success_rate = if meta.tool_call_count == 0 {
            1.0
        } else {
            let succeeded = meta.tool_call_count.saturating_sub(meta.failed_tool_calls);
            succeeded as f64 / meta.tool_call_count as f64
        };

        Some(SessionAnalytics {
            session_id: context.session_id.clone(),
            duration_ms,
            message_count: meta.message_count,
            handoff_count: meta.handoff_count,
            tool_call_count: meta.tool_call_count,
            error_count: meta.error_count,
            tool_success_rate,
            complexity_score: complexity_score(meta),
            satisfaction: satisfaction_indicators(&context.conversation_history),
            issue_resolved: meta.issue_resolved,
            current_agent: meta.current_agent.clone(),
        })
    }

    /// Remove contexts idle for longer than the expiry; returns how many.
    pub fn cleanup_expired_contexts(&self) -> usize {
        self.cleanup_expired_contexts_at(Utc::now())
    }

    /// Expiry sweep evaluated against an explicit clock reading
    pub fn cleanup_expired_contexts_at(&self, now: DateTime<Utc>) -> usize {
        self.sweep_expired_at(now).len()
    }

    /// Remove idle contexts and return their session ids
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = inner
            .contexts
            .iter()
            .filter(|(_, c)| now - c.metadata.last_activity > self.expiry)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &expired {
            inner.contexts.remove(session_id);
            inner.snapshots.remove(session_id);
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired conversation contexts swept");
        }
        expired
    }

    /// Versioned copy of a context
    pub fn export_context(&self, session_id: &str) -> OrchestrationResult<ContextExport> {
        let context = self
            .get(session_id)
            .ok_or_else(|| OrchestrationError::session_not_found(session_id))?;
        Ok(ContextExport {
            schema_version: CONTEXT_SCHEMA_VERSION,
            exported_at: Utc::now(),
            context,
        })
    }

    /// Install an exported context, replacing any live one with the same id.
    ///
    /// The imported timestamps are kept as exported.
    pub fn import_context(&self, export: ContextExport) -> OrchestrationResult<()> {
        if export.schema_version != CONTEXT_SCHEMA_VERSION {
            return Err(OrchestrationError::validation(format!(
                "unsupported context schema version {} (expected {})",
                export.schema_version, CONTEXT_SCHEMA_VERSION
            )));
        }
        if export.context.session_id.trim().is_empty() {
            return Err(OrchestrationError::validation(
                "imported context has an empty session id",
            ));
        }

        let session_id = export.context.session_id.clone();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.contexts.insert(session_id.clone(), export.context);
        inner.push_snapshot(&session_id, self.max_snapshots);
        Ok(())
    }

    /// Fold `secondary` into `primary` and delete `secondary`.
    ///
    /// Histories are concatenated (primary first), primary shared variables
    /// win on key conflicts and counters are summed.
    pub fn merge_contexts(
        &self,
        primary: &str,
        secondary: &str,
    ) -> OrchestrationResult<ConversationContext> {
        if primary == secondary {
            return Err(OrchestrationError::validation(
                "cannot merge a context into itself",
            ));
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.contexts.contains_key(primary) {
            return Err(OrchestrationError::session_not_found(primary));
        }
        let other = inner
            .contexts
            .remove(secondary)
            .ok_or_else(|| OrchestrationError::session_not_found(secondary))?;
        inner.snapshots.remove(secondary);

        let merged = {
            let context = inner
                .contexts
                .get_mut(primary)
                .ok_or_else(|| OrchestrationError::session_not_found(primary))?;

            context.conversation_history.extend(other.conversation_history);
            for (key, value) in other.shared_variables {
                context.shared_variables.entry(key).or_insert(value);
            }

            let meta = &mut context.metadata;
            meta.message_count = context.conversation_history.len() as u32;
            meta.handoff_count += other.metadata.handoff_count;
            meta.tool_call_count += other.metadata.tool_call_count;
            meta.error_count += other.metadata.error_count;
            meta.failed_tool_calls += other.metadata.failed_tool_calls;
            meta.created_at = meta.created_at.min(other.metadata.created_at);
            for (key, value) in other.metadata.fields {
                meta.fields.entry(key).or_insert(value);
            }
            if context.user_id.is_none() {
                context.user_id = other.user_id;
            }
            meta.last_activity = Utc::now();
            context.clone()
        };
        inner.push_snapshot(primary, self.max_snapshots);

        tracing::info!(primary, secondary, "conversation contexts merged");
        Ok(merged)
    }

    /// Snapshot history of a session, oldest first
    pub fn snapshots(&self, session_id: &str) -> Vec<ContextSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(session_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Restore the live context from snapshot `index` (0 = oldest retained)
    pub fn rollback(&self, session_id: &str, index: usize) -> OrchestrationResult<ConversationContext> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = inner
            .snapshots
            .get(session_id)
            .ok_or_else(|| OrchestrationError::session_not_found(session_id))?
            .get(index)
            .cloned()
            .ok_or_else(|| {
                OrchestrationError::validation(format!(
                    "no snapshot {} for session {}",
                    index, session_id
                ))
            })?;

        let mut context = snapshot.context;
        context.metadata.last_activity = Utc::now();
        inner.contexts.insert(session_id.to_string(), context.clone());
        Ok(context)
    }

    /// Delete a context and its snapshots; returns whether it existed
    pub fn remove(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.snapshots.remove(session_id);
        inner.contexts.remove(session_id).is_some()
    }

    /// Delete every context
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.contexts.clear();
        inner.snapshots.clear();
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contexts
            .len()
    }

    /// Whether no context is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn complexity_score(meta: &ContextMetadata) -> u8 {
    let score = meta.message_count.min(MESSAGE_COUNT_CAP) as f64
        + meta.handoff_count as f64 * 2.0
        + meta.tool_call_count as f64 * 1.5
        + meta.error_count as f64 * 3.0;
    score.min(100.0).round() as u8
}

fn satisfaction_indicators(history: &[Message]) -> SatisfactionIndicators {
    let mut positive = 0u32;
    let mut negative = 0u32;

    for message in history.iter().filter(|m| m.role == MessageRole::User) {
        let text = message.content.to_lowercase();
        if POSITIVE_KEYWORDS.iter().any(|k| text.contains(k)) {
            positive += 1;
        }
        if NEGATIVE_KEYWORDS.iter().any(|k| text.contains(k)) {
            negative += 1;
        }
    }

    let total = positive + negative;
    let score = if total == 0 {
        0.0
    } else {
        (positive as f64 - negative as f64) / total as f64
    };

    SatisfactionIndicators {
        positive_signals: positive,
        negative_signals: negative,
        score,
    }
}
