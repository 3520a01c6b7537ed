//! Keeps session state and the context store consistent
//!
//! Every write goes through to both stores and is then published to
//! subscribers. Subscribers are either callbacks registered per event kind
//! or broadcast receivers that see every event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;

use super::context::{ContextUpdate, ConversationContext, ConversationContextStore};
use super::error::OrchestrationResult;
use super::session::{HandoffRecord, HandoffRequest, Session, SessionState};

/// Shared variable written when a handoff preserves context
pub const LAST_HANDOFF_CONTEXT_KEY: &str = "lastHandoffContext";

/// Notification published after a synchronized write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    AgentHandoff {
        session_id: String,
        record: HandoffRecord,
    },
    ContextUpdate {
        session_id: String,
        key: String,
        agent: String,
    },
    StateReset {
        session_id: String,
    },
}

impl SyncEvent {
    /// Kind used for callback subscriptions
    pub fn kind(&self) -> SyncEventKind {
        match self {
            Self::AgentHandoff { .. } => SyncEventKind::AgentHandoff,
            Self::ContextUpdate { .. } => SyncEventKind::ContextUpdate,
            Self::StateReset { .. } => SyncEventKind::StateReset,
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::AgentHandoff { session_id, .. }
            | Self::ContextUpdate { session_id, .. }
            | Self::StateReset { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    AgentHandoff,
    ContextUpdate,
    StateReset,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentHandoff => "agent_handoff",
            Self::ContextUpdate => "context_update",
            Self::StateReset => "state_reset",
        }
    }
}

impl std::fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscriber callback; errors are logged and swallowed
pub type SyncCallback = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    kind: SyncEventKind,
    callback: SyncCallback,
}

type SubscriberList = RwLock<Vec<Subscriber>>;

/// Handle returned by [`StateSynchronizer::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberList>,
}

impl Subscription {
    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut subscribers = subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != self.id);
        subscribers.len() != before
    }
}

/// Read-only combined view of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SynchronizedState {
    pub session: Option<Session>,
    pub context: Option<ConversationContext>,
    /// Agent and handoff count agree across both stores
    pub consistent: bool,
}

/// Bridge between [`SessionState`] and [`ConversationContextStore`]
pub struct StateSynchronizer {
    sessions: Arc<SessionState>,
    contexts: Arc<ConversationContextStore>,
    subscribers: Arc<SubscriberList>,
    next_id: AtomicU64,
    sender: broadcast::Sender<SyncEvent>,
}

impl StateSynchronizer {
    /// Create a synchronizer over both stores
    pub fn new(sessions: Arc<SessionState>, contexts: Arc<ConversationContextStore>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sessions,
            contexts,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionState> {
        &self.sessions
    }

    pub fn contexts(&self) -> &Arc<ConversationContextStore> {
        &self.contexts
    }

    /// Register a callback for one event kind
    pub fn subscribe<F>(&self, kind: SyncEventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                kind,
                callback: Arc::new(callback),
            });
        tracing::debug!(kind = %kind, subscription = id, "sync subscriber added");
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Receive every published event.
    ///
    /// Slow receivers lag and miss events rather than blocking publishers.
    pub fn watch(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of registered callbacks
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver to matching callbacks and broadcast receivers.
    ///
    /// Returns how many callbacks completed without error.
    fn publish(&self, event: SyncEvent) -> usize {
        let kind = event.kind();
        let callbacks: Vec<(u64, SyncCallback)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    kind = %kind,
                    subscription = id,
                    error = %e,
                    "sync subscriber failed"
                ),
                Err(_) => tracing::warn!(
                    kind = %kind,
                    subscription = id,
                    "sync subscriber panicked"
                ),
            }
        }

        // no receivers is fine
        let _ = self.sender.send(event);
        delivered
    }

    /// Initial agent assignment; not counted as a handoff.
    ///
    /// A session that already has an agent keeps it, so repeated calls
    /// never shift `previous_agent`.
    pub fn start_session(
        &self,
        session_id: &str,
        agent: &str,
        user_id: Option<&str>,
    ) -> OrchestrationResult<ConversationContext> {
        if let Some(current) = self.sessions.peek(session_id).and_then(|s| s.current_agent) {
            tracing::debug!(session_id, agent = %current, "session already started");
            return Ok(self.contexts.get_or_create(session_id, user_id));
        }
        self.sessions.set_current_agent(session_id, agent);
        self.contexts.get_or_create(session_id, user_id);
        self.contexts.update(
            session_id,
            ContextUpdate {
                current_agent: Some(agent.to_string()),
                ..ContextUpdate::default()
            },
        )
    }

    /// Commit a handoff to session state and mirror it into the context
    pub fn sync_handoff(
        &self,
        session_id: &str,
        request: HandoffRequest,
    ) -> OrchestrationResult<HandoffRecord> {
        let record = self.sessions.commit_handoff(session_id, request)?;
        self.contexts
            .set_current_agent(session_id, &record.target_agent);

        if record.preserve_context {
            let breadcrumb = serde_json::json!({
                "from": record.source_agent,
                "to": record.target_agent,
                "trigger": record.trigger,
                "conditions": record.conditions,
                "at": record.timestamp,
            });
            self.sessions
                .update_shared_context(session_id, LAST_HANDOFF_CONTEXT_KEY, breadcrumb.clone());
            self.contexts
                .set_shared_variable(session_id, LAST_HANDOFF_CONTEXT_KEY, breadcrumb);
        }

        tracing::info!(
            session_id,
            from = %record.source_agent,
            to = %record.target_agent,
            "handoff synchronized"
        );
        self.publish(SyncEvent::AgentHandoff {
            session_id: session_id.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    /// Write a shared value to both stores
    pub fn sync_shared_context(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
        agent_name: &str,
    ) {
        self.sessions
            .update_shared_context(session_id, key, value.clone());
        self.contexts.set_shared_variable(session_id, key, value);
        self.publish(SyncEvent::ContextUpdate {
            session_id: session_id.to_string(),
            key: key.to_string(),
            agent: agent_name.to_string(),
        });
    }

    /// Combined view without creating anything
    pub fn get_synchronized_state(&self, session_id: &str) -> SynchronizedState {
        let session = self.sessions.peek(session_id);
        let context = self.contexts.get(session_id);
        let consistent = match (&session, &context) {
            (Some(s), Some(c)) => {
                s.current_agent == c.metadata.current_agent
                    && s.handoff_history.len() == c.metadata.handoff_count as usize
            }
            (None, None) => true,
            _ => false,
        };
        SynchronizedState {
            session,
            context,
            consistent,
        }
    }

    /// Drop idle sessions from both stores; returns the removed ids.
    pub fn cleanup_expired(&self) -> Vec<String> {
        self.cleanup_expired_at(Utc::now())
    }

    /// Expiry sweep against an explicit clock reading.
    ///
    /// Idleness is judged by the context store; each expired id is also
    /// removed from session state and published as `state_reset`.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self.contexts.sweep_expired_at(now);
        for session_id in &expired {
            self.sessions.reset(session_id);
            self.publish(SyncEvent::StateReset {
                session_id: session_id.clone(),
            });
        }
        expired
    }

    /// Clear both stores for the session
    pub fn reset_state(&self, session_id: &str) {
        self.sessions.reset(session_id);
        self.contexts.remove(session_id);
        tracing::info!(session_id, "session state reset");
        self.publish(SyncEvent::StateReset {
            session_id: session_id.to_string(),
        });
    }
}

impl std::fmt::Debug for StateSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSynchronizer")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
