//! Escalation engine
//!
//! Decides whether a conversation should leave its current agent: first by
//! walking an ordered rule list (first match wins), then by asking a routing
//! classifier or, without one, matching the message against trigger phrases.
//! Decisions are recorded in the event log; session state is never touched.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use super::context::ConversationContext;
use super::error::{OrchestrationError, OrchestrationResult};
use super::events::{EventData, EventLog, EventType};
use crate::config::{EscalationConfig, EscalationRuleConfig, RuleConditionConfig};

/// What a matched rule asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationAction {
    Escalate,
    Handoff,
    Redirect,
}

impl EscalationAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::Handoff => "handoff",
            Self::Redirect => "redirect",
        }
    }
}

impl std::fmt::Display for EscalationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EscalationAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "escalate" => Ok(Self::Escalate),
            "handoff" => Ok(Self::Handoff),
            "redirect" => Ok(Self::Redirect),
            _ => Err(anyhow::anyhow!("Invalid escalation action: {}", s)),
        }
    }
}

/// Pure predicate over a context snapshot
pub type RuleCondition = Arc<dyn Fn(&ConversationContext) -> bool + Send + Sync>;

/// One configured escalation rule
#[derive(Clone)]
pub struct EscalationRule {
    pub trigger: String,
    condition: RuleCondition,
    pub action: EscalationAction,
    pub target: Option<String>,
    /// Template; `{agent}`, `{session_id}`, `{trigger}` and `{target}` are substituted
    pub message: Option<String>,
}

impl EscalationRule {
    /// Rule with a predicate and no target or message
    pub fn new<F>(trigger: impl Into<String>, action: EscalationAction, condition: F) -> Self
    where
        F: Fn(&ConversationContext) -> bool + Send + Sync + 'static,
    {
        Self {
            trigger: trigger.into(),
            condition: Arc::new(condition),
            action,
            target: None,
            message: None,
        }
    }

    /// Set the agent the rule routes to
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the message template
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Evaluate the predicate
    pub fn matches(&self, context: &ConversationContext) -> bool {
        (self.condition)(context)
    }

    /// Compile a declarative rule from configuration
    pub fn from_config(config: &EscalationRuleConfig) -> OrchestrationResult<Self> {
        let action: EscalationAction = config
            .action
            .parse()
            .map_err(|e: anyhow::Error| OrchestrationError::configuration(e.to_string()))?;

        let rule = match config.when.clone() {
            RuleConditionConfig::ErrorCountAtLeast(n) => {
                Self::new(&config.trigger, action, move |c| c.metadata.error_count >= n)
            }
            RuleConditionConfig::HandoffCountAtLeast(n) => {
                Self::new(&config.trigger, action, move |c| c.metadata.handoff_count >= n)
            }
            RuleConditionConfig::MessageCountAtLeast(n) => {
                Self::new(&config.trigger, action, move |c| c.metadata.message_count >= n)
            }
            RuleConditionConfig::FailedToolCallsAtLeast(n) => {
                Self::new(&config.trigger, action, move |c| {
                    c.metadata.failed_tool_calls >= n
                })
            }
            RuleConditionConfig::LastMessageContains(phrases) => {
                let phrases: Vec<String> = phrases.iter().map(|p| p.to_lowercase()).collect();
                Self::new(&config.trigger, action, move |c| {
                    c.last_user_message().map_or(false, |m| {
                        let text = m.content.to_lowercase();
                        phrases.iter().any(|p| text.contains(p.as_str()))
                    })
                })
            }
            RuleConditionConfig::VariableEquals { key, value } => {
                Self::new(&config.trigger, action, move |c| match c.variable(&key) {
                    Some(serde_json::Value::String(s)) => *s == value,
                    Some(other) => other.to_string() == value,
                    None => false,
                })
            }
        };

        let rule = match &config.target {
            Some(target) => rule.with_target(target),
            None => rule,
        };
        Ok(match &config.message {
            Some(message) => rule.with_message(message),
            None => rule,
        })
    }

    fn render_message(&self, agent: &str, session_id: &str) -> Option<String> {
        self.message.as_ref().map(|template| {
            render_template(
                template,
                &[
                    ("agent", agent),
                    ("session_id", session_id),
                    ("trigger", &self.trigger),
                    ("target", self.target.as_deref().unwrap_or("")),
                ],
            )
        })
    }
}

impl std::fmt::Debug for EscalationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationRule")
            .field("trigger", &self.trigger)
            .field("action", &self.action)
            .field("target", &self.target)
            .field("message", &self.message)
            .finish()
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Substitute `{name}` placeholders; unknown names are left as written
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Classifier verdict for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Chat,
    Supervisor,
}

/// Optional routing hook supplied by the integrating scenario
pub type RoutingClassifier = Arc<dyn Fn(&str, &ConversationContext) -> Route + Send + Sync>;

/// What produced an escalation decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSource {
    Rule,
    Classifier,
    Keywords,
}

/// Typed payload of an `escalation` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub session_id: String,
    pub trigger: String,
    pub source: EscalationSource,
    pub action: EscalationAction,
    pub target: Option<String>,
    pub message: Option<String>,
}

/// Result of [`EscalationEngine::handle_escalation`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub escalated: bool,
    pub action: Option<EscalationAction>,
    pub target: Option<String>,
    pub trigger: Option<String>,
    pub message: Option<String>,
}

impl EscalationOutcome {
    /// Conversation stays with the current agent
    pub fn stay() -> Self {
        Self::default()
    }
}

const KEYWORD_TRIGGER: &str = "supervisor_keywords";
const CLASSIFIER_TRIGGER: &str = "supervisor_route";

/// Rule and heuristic based escalation decisions
pub struct EscalationEngine {
    rules: Vec<EscalationRule>,
    classifier: Option<RoutingClassifier>,
    keywords: Vec<String>,
    supervisor_agent: String,
    events: Arc<EventLog>,
}

impl EscalationEngine {
    /// Engine with no rules, no classifier and the default trigger phrases
    pub fn new(events: Arc<EventLog>) -> Self {
        let defaults = EscalationConfig::default();
        Self {
            rules: Vec::new(),
            classifier: None,
            keywords: defaults.trigger_keywords,
            supervisor_agent: defaults.supervisor_agent,
            events,
        }
    }

    /// Engine configured from the `[escalation]` section
    pub fn from_config(config: &EscalationConfig, events: Arc<EventLog>) -> OrchestrationResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(EscalationRule::from_config)
            .collect::<OrchestrationResult<Vec<_>>>()?;

        Ok(Self::new(events)
            .with_rules(rules)
            .with_keywords(config.trigger_keywords.clone())
            .with_supervisor_agent(&config.supervisor_agent))
    }

    /// Append rules after the existing ones
    pub fn with_rules(mut self, rules: Vec<EscalationRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Install a routing classifier
    pub fn with_classifier(mut self, classifier: RoutingClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Replace the fallback trigger phrases
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords.into_iter().map(|k| k.to_lowercase()).collect();
        self
    }

    /// Agent used for supervisor escalations
    pub fn with_supervisor_agent(mut self, agent: &str) -> Self {
        self.supervisor_agent = agent.to_string();
        self
    }

    /// Configured rules in evaluation order
    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    /// Agent used for supervisor escalations
    pub fn supervisor_agent(&self) -> &str {
        &self.supervisor_agent
    }

    /// First rule whose condition holds
    pub fn check_escalation_rules(&self, context: &ConversationContext) -> Option<&EscalationRule> {
        self.rules.iter().find(|rule| rule.matches(context))
    }

    /// Classifier verdict, or the keyword heuristic without a classifier
    pub fn should_escalate_to_supervisor(&self, message: &str, context: &ConversationContext) -> bool {
        match &self.classifier {
            Some(classify) => classify(message, context) == Route::Supervisor,
            None => self.matches_keywords(message),
        }
    }

    fn matches_keywords(&self, message: &str) -> bool {
        let text = message.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// Decide whether to escalate and record the decision.
    pub fn handle_escalation(
        &self,
        message: &str,
        context: &ConversationContext,
        agent_name: &str,
    ) -> EscalationOutcome {
        if let Some(rule) = self.check_escalation_rules(context) {
            let payload = EscalationPayload {
                session_id: context.session_id.clone(),
                trigger: rule.trigger.clone(),
                source: EscalationSource::Rule,
                action: rule.action,
                target: rule.target.clone(),
                message: rule.render_message(agent_name, &context.session_id),
            };
            tracing::info!(
                session_id = %context.session_id,
                agent = agent_name,
                trigger = %rule.trigger,
                action = %rule.action,
                "escalation rule matched"
            );
            return self.record(agent_name, payload);
        }

        if self.should_escalate_to_supervisor(message, context) {
            let (trigger, source) = if self.classifier.is_some() {
                (CLASSIFIER_TRIGGER, EscalationSource::Classifier)
            } else {
                (KEYWORD_TRIGGER, EscalationSource::Keywords)
            };
            let payload = EscalationPayload {
                session_id: context.session_id.clone(),
                trigger: trigger.to_string(),
                source,
                action: EscalationAction::Escalate,
                target: Some(self.supervisor_agent.clone()),
                message: None,
            };
            tracing::info!(
                session_id = %context.session_id,
                agent = agent_name,
                "escalating to supervisor"
            );
            return self.record(agent_name, payload);
        }

        EscalationOutcome::stay()
    }

    fn record(&self, agent_name: &str, payload: EscalationPayload) -> EscalationOutcome {
        let outcome = EscalationOutcome {
            escalated: true,
            action: Some(payload.action),
            target: payload.target.clone(),
            trigger: Some(payload.trigger.clone()),
            message: payload.message.clone(),
        };
        self.events
            .record(EventType::Escalation, agent_name, EventData::Escalation(payload), None);
        outcome
    }
}

impl std::fmt::Debug for EscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationEngine")
            .field("rules", &self.rules)
            .field("classifier", &self.classifier.is_some())
            .field("keywords", &self.keywords)
            .field("supervisor_agent", &self.supervisor_agent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::context::Message;

    fn context_with_errors(errors: u32) -> ConversationContext {
        let mut context = ConversationContext::new("s", None);
        context.metadata.error_count = errors;
        context
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let events = Arc::new(EventLog::new());
        let engine = EscalationEngine::new(events).with_rules(vec![
            EscalationRule::new("never", EscalationAction::Redirect, |_| false),
            EscalationRule::new("errors", EscalationAction::Escalate, |c| {
                c.metadata.error_count >= 2
            })
            .with_target("supervisor"),
            EscalationRule::new("any", EscalationAction::Handoff, |_| true).with_target("sales"),
        ]);

        let rule = engine.check_escalation_rules(&context_with_errors(3)).unwrap();
        assert_eq!(rule.trigger, "errors");

        let rule = engine.check_escalation_rules(&context_with_errors(0)).unwrap();
        assert_eq!(rule.trigger, "any");
    }

    #[test]
    fn test_no_rules_no_match() {
        let engine = EscalationEngine::new(Arc::new(EventLog::new()));
        assert!(engine.check_escalation_rules(&context_with_errors(10)).is_none());
    }

    #[test]
    fn test_keyword_heuristic_is_case_insensitive() {
        let engine = EscalationEngine::new(Arc::new(EventLog::new()));
        let context = ConversationContext::new("s", None);
        assert!(engine.should_escalate_to_supervisor("Let me talk to a HUMAN please", &context));
        assert!(engine.should_escalate_to_supervisor("I want to file a Complaint", &context));
        assert!(!engine.should_escalate_to_supervisor("What does the pro plan cost?", &context));
    }

    #[test]
    fn test_classifier_overrides_keywords() {
        let engine = EscalationEngine::new(Arc::new(EventLog::new())).with_classifier(Arc::new(
            |message: &str, _: &ConversationContext| {
                if message.contains("refund") {
                    Route::Supervisor
                } else {
                    Route::Chat
                }
            },
        ));
        let context = ConversationContext::new("s", None);
        assert!(engine.should_escalate_to_supervisor("I need a refund", &context));
        // would match the keyword list, but the classifier decides
        assert!(!engine.should_escalate_to_supervisor("get me a human", &context));
    }

    #[test]
    fn test_handle_escalation_records_events() {
        let events = Arc::new(EventLog::new());
        let engine = EscalationEngine::new(events.clone()).with_rules(vec![EscalationRule::new(
            "errors",
            EscalationAction::Handoff,
            |c| c.metadata.error_count >= 2,
        )
        .with_target("tech")
        .with_message("{agent} hands {session_id} to {target} ({trigger})")]);

        let outcome = engine.handle_escalation("hello", &context_with_errors(2), "greeter");
        assert!(outcome.escalated);
        assert_eq!(outcome.action, Some(EscalationAction::Handoff));
        assert_eq!(outcome.target.as_deref(), Some("tech"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("greeter hands s to tech (errors)")
        );

        let outcome = engine.handle_escalation("I want a manager", &context_with_errors(0), "greeter");
        assert!(outcome.escalated);
        assert_eq!(outcome.action, Some(EscalationAction::Escalate));
        assert_eq!(outcome.target.as_deref(), Some("supervisor"));

        let outcome = engine.handle_escalation("thanks!", &context_with_errors(0), "greeter");
        assert_eq!(outcome, EscalationOutcome::stay());

        let recorded = events.query_by_type(EventType::Escalation);
        assert_eq!(recorded.len(), 2);
        match &recorded[1].data {
            EventData::Escalation(payload) => {
                assert_eq!(payload.source, EscalationSource::Keywords);
                assert_eq!(payload.target.as_deref(), Some("supervisor"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rules_from_config() {
        let config = EscalationRuleConfig {
            trigger: "angry".to_string(),
            action: "Redirect".to_string(),
            target: Some("retention".to_string()),
            message: None,
            when: RuleConditionConfig::LastMessageContains(vec!["Cancel".to_string()]),
        };
        let rule = EscalationRule::from_config(&config).unwrap();
        assert_eq!(rule.action, EscalationAction::Redirect);

        let mut context = ConversationContext::new("s", None);
        assert!(!rule.matches(&context));
        context
            .conversation_history
            .push(Message::user("I want to CANCEL my plan"));
        assert!(rule.matches(&context));

        let config = EscalationRuleConfig {
            trigger: "vip".to_string(),
            action: "handoff".to_string(),
            target: None,
            message: None,
            when: RuleConditionConfig::VariableEquals {
                key: "tier".to_string(),
                value: "vip".to_string(),
            },
        };
        let rule = EscalationRule::from_config(&config).unwrap();
        let mut context = ConversationContext::new("s", None);
        context.shared_variables.insert(
            "tier".to_string(),
            crate::orchestration::session::ContextValue::new(serde_json::json!("vip")),
        );
        assert!(rule.matches(&context));

        let bad = EscalationRuleConfig {
            action: "teleport".to_string(),
            ..config
        };
        assert!(matches!(
            EscalationRule::from_config(&bad),
            Err(OrchestrationError::Configuration { .. })
        ));
    }

    #[test]
    fn test_render_template_leaves_unknown_placeholders() {
        let rendered = render_template("{agent} -> {unknown}", &[("agent", "sales")]);
        assert_eq!(rendered, "sales -> {unknown}");
    }
}
