//! Per-session agent state: who holds the conversation, who held it before,
//! the handoff history and the key-value context shared across handoffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::error::{OrchestrationError, OrchestrationResult};
use crate::config::SessionConfig;

/// Type tag of a stored context value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    /// Tag for a JSON value
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::Array,
            serde_json::Value::Object(_) => Self::Object,
        }
    }
}

/// A shared value together with when it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextValue {
    pub value: serde_json::Value,
    pub produced_at: DateTime<Utc>,
    pub value_type: ValueType,
}

impl ContextValue {
    /// Wrap a value, stamping it now
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value_type: ValueType::of(&value),
            produced_at: Utc::now(),
            value,
        }
    }
}

/// Parameters of a handoff before it is recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub source_agent: String,
    pub target_agent: String,
    pub trigger: String,
    #[serde(default)]
    pub conditions: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_preserve_context")]
    pub preserve_context: bool,
}

fn default_preserve_context() -> bool {
    true
}

impl HandoffRequest {
    /// Handoff with an empty trigger and preserved context
    pub fn new(source_agent: impl Into<String>, target_agent: impl Into<String>) -> Self {
        Self {
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            trigger: String::new(),
            conditions: BTreeMap::new(),
            preserve_context: true,
        }
    }

    /// Set the free-text reason
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = trigger.into();
        self
    }

    /// Attach a condition entry
    pub fn with_condition(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }

    /// Control whether the shared context is carried over
    pub fn preserve_context(mut self, preserve: bool) -> Self {
        self.preserve_context = preserve;
        self
    }
}

/// A recorded handoff. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub source_agent: String,
    pub target_agent: String,
    pub trigger: String,
    pub conditions: BTreeMap<String, serde_json::Value>,
    pub preserve_context: bool,
    pub timestamp: DateTime<Utc>,
}

impl HandoffRecord {
    fn from_request(request: HandoffRequest) -> Self {
        Self {
            source_agent: request.source_agent,
            target_agent: request.target_agent,
            trigger: request.trigger,
            conditions: request.conditions,
            preserve_context: request.preserve_context,
            timestamp: Utc::now(),
        }
    }
}

/// Loop-suppression parameters for [`Session::can_handoff_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffPolicy {
    /// Number of most recent handoffs inspected
    pub window: usize,
    /// Occurrences of a target inside the window that block it
    pub threshold: usize,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self {
            window: 5,
            threshold: 3,
        }
    }
}

impl From<&SessionConfig> for HandoffPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            window: config.loop_window,
            threshold: config.loop_threshold,
        }
    }
}

/// Plain-data session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub current_agent: Option<String>,
    pub previous_agent: Option<String>,
    pub handoff_history: Vec<HandoffRecord>,
    pub shared_context: HashMap<String, ContextValue>,
}

impl Session {
    /// Fresh session with no agent yet
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_agent: None,
            previous_agent: None,
            handoff_history: Vec::new(),
            shared_context: HashMap::new(),
        }
    }

    /// Handoff legality predicate.
    ///
    /// Rejects an immediate bounce back to the previous agent, and any target
    /// that already received `threshold` or more of the last `window` handoffs.
    /// Both checks apply independently.
    pub fn can_handoff_to(&self, target_agent: &str, policy: &HandoffPolicy) -> bool {
        if self.previous_agent.as_deref() == Some(target_agent) {
            return false;
        }

        let start = self.handoff_history.len().saturating_sub(policy.window);
        let occurrences = self.handoff_history[start..]
            .iter()
            .filter(|record| record.target_agent == target_agent)
            .count();

        occurrences < policy.threshold
    }

    fn shift_agent(&mut self, name: &str) {
        self.previous_agent = self.current_agent.take();
        self.current_agent = Some(name.to_string());
    }
}

/// Session store keyed by session id.
///
/// Sessions are created on first access and removed by [`SessionState::reset`].
#[derive(Debug, Default)]
pub struct SessionState {
    sessions: RwLock<HashMap<String, Session>>,
    policy: HandoffPolicy,
}

impl SessionState {
    /// Store using the default loop-suppression policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Store using a custom loop-suppression policy
    pub fn with_policy(policy: HandoffPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Active loop-suppression policy
    pub fn policy(&self) -> HandoffPolicy {
        self.policy
    }

    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        f(session)
    }

    /// Clone of the session, creating it if needed
    pub fn get(&self, session_id: &str) -> Session {
        self.with_session(session_id, |session| session.clone())
    }

    /// Clone of the session if it exists, without creating it
    pub fn peek(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Current agent of the session
    pub fn current_agent(&self, session_id: &str) -> Option<String> {
        self.with_session(session_id, |session| session.current_agent.clone())
    }

    /// Move the current agent to `previous_agent` and install `name`.
    ///
    /// No legality check; the handoff coordinator gates this.
    pub fn set_current_agent(&self, session_id: &str, name: &str) {
        self.with_session(session_id, |session| session.shift_agent(name));
    }

    /// Append a handoff record with a server-assigned timestamp
    pub fn add_handoff(&self, session_id: &str, request: HandoffRequest) -> HandoffRecord {
        let record = HandoffRecord::from_request(request);
        self.with_session(session_id, |session| {
            session.handoff_history.push(record.clone())
        });
        record
    }

    /// Legality predicate for the session; pure
    pub fn can_handoff_to(&self, session_id: &str, target_agent: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(session) => session.can_handoff_to(target_agent, &self.policy),
            None => true,
        }
    }

    /// Re-check legality and apply the handoff under a single write lock.
    ///
    /// When the session has no agent yet, the source becomes the current
    /// agent first so the target's `previous_agent` is the source.
    pub fn commit_handoff(
        &self,
        session_id: &str,
        request: HandoffRequest,
    ) -> OrchestrationResult<HandoffRecord> {
        let policy = self.policy;
        self.with_session(session_id, |session| {
            if !session.can_handoff_to(&request.target_agent, &policy) {
                return Err(OrchestrationError::CircularHandoff {
                    target: request.target_agent.clone(),
                });
            }

            if session.current_agent.is_none() {
                session.current_agent = Some(request.source_agent.clone());
            }

            let target = request.target_agent.clone();
            let record = HandoffRecord::from_request(request);
            session.handoff_history.push(record.clone());
            session.shift_agent(&target);
            Ok(record)
        })
    }

    /// Store a shared value, overwriting by key
    pub fn update_shared_context(&self, session_id: &str, key: &str, value: serde_json::Value) {
        self.with_session(session_id, |session| {
            session
                .shared_context
                .insert(key.to_string(), ContextValue::new(value));
        });
    }

    /// Read a shared value
    pub fn get_shared_context(&self, session_id: &str, key: &str) -> Option<ContextValue> {
        self.with_session(session_id, |session| session.shared_context.get(key).cloned())
    }

    /// Drop all shared values of a session
    pub fn clear_shared_context(&self, session_id: &str) {
        self.with_session(session_id, |session| session.shared_context.clear());
    }

    /// Destroy a session; returns whether it existed
    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    /// Destroy every session
    pub fn reset_all(&self) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Ids of all live sessions
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
