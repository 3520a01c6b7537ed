//! TOML configuration parsing and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handoff loop-suppression parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How many of the most recent handoffs are inspected
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    /// Occurrences of the same target inside the window that block a handoff
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
}

fn default_loop_window() -> usize {
    5
}

fn default_loop_threshold() -> usize {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loop_window: default_loop_window(),
            loop_threshold: default_loop_threshold(),
        }
    }
}

/// Tool-resolution loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    5
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// Conversation context store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Idle time after which a context is swept
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,
    /// Snapshots retained per session
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

fn default_expiry_hours() -> u64 {
    24
}

fn default_max_snapshots() -> usize {
    50
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

/// Escalation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Agent that receives keyword-triggered escalations
    #[serde(default = "default_supervisor_agent")]
    pub supervisor_agent: String,
    /// Case-insensitive phrases that trigger the fallback heuristic
    #[serde(default = "default_trigger_keywords")]
    pub trigger_keywords: Vec<String>,
    /// Ordered rule list, first match wins
    #[serde(default)]
    pub rules: Vec<EscalationRuleConfig>,
}

fn default_supervisor_agent() -> String {
    "supervisor".to_string()
}

fn default_trigger_keywords() -> Vec<String> {
    [
        "human",
        "supervisor",
        "manager",
        "representative",
        "escalate",
        "complaint",
        "speak to someone",
        "real person",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            supervisor_agent: default_supervisor_agent(),
            trigger_keywords: default_trigger_keywords(),
            rules: Vec::new(),
        }
    }
}

/// Declarative escalation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRuleConfig {
    pub trigger: String,
    /// One of "escalate", "handoff", "redirect"
    pub action: String,
    pub target: Option<String>,
    /// Template; `{agent}`, `{session_id}`, `{trigger}` and `{target}` are substituted
    pub message: Option<String>,
    pub when: RuleConditionConfig,
}

/// Conditions a declarative rule can test against a conversation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleConditionConfig {
    ErrorCountAtLeast(u32),
    HandoffCountAtLeast(u32),
    MessageCountAtLeast(u32),
    FailedToolCallsAtLeast(u32),
    /// Latest user message contains any of these phrases (case-insensitive)
    LastMessageContains(Vec<String>),
    /// Shared variable `key` currently holds the string `value`
    VariableEquals { key: String, value: String },
}

/// Agents taking part in the deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Known agent names; empty accepts any name
    #[serde(default)]
    pub agents: Vec<String>,
    pub initial_agent: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Markdown audit file; no audit trail when unset
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

const RULE_ACTIONS: [&str; 3] = ["escalate", "handoff", "redirect"];

/// Loads and manages TOML configuration.
#[derive(Debug)]
pub struct ConfigurationLoader {
    pub config_path: PathBuf,
    pub config: OrchestrationConfig,
}

impl ConfigurationLoader {
    /// Initialize configuration loader.
    ///
    /// # Arguments
    /// * `config_path` - Path to TOML config file. If None or missing, uses default config.
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("config/ark.toml"));

        let config = if config_path.exists() {
            Self::load_config(&config_path)?
        } else {
            OrchestrationConfig::default()
        };

        let loader = Self {
            config_path,
            config,
        };
        loader.validate()?;
        Ok(loader)
    }

    /// Create a configuration loader from a pre-parsed configuration.
    pub fn from_config(config: OrchestrationConfig) -> Result<Self> {
        let loader = Self {
            config_path: PathBuf::from("config/ark.toml"),
            config,
        };
        loader.validate()?;
        Ok(loader)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OrchestrationConfig =
            toml::from_str(content).context("Failed to parse TOML config")?;
        Self::from_config(config)
    }

    fn load_config(path: &Path) -> Result<OrchestrationConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Check numeric bounds and that every referenced agent exists.
    pub fn validate(&self) -> Result<()> {
        let config = &self.config;

        if config.session.loop_window == 0 {
            anyhow::bail!("session.loop_window must be at least 1");
        }
        if config.session.loop_threshold == 0 {
            anyhow::bail!("session.loop_threshold must be at least 1");
        }
        if config.tool_loop.max_iterations == 0 {
            anyhow::bail!("tool_loop.max_iterations must be at least 1");
        }
        if config.context.max_snapshots == 0 {
            anyhow::bail!("context.max_snapshots must be at least 1");
        }
        if config.context.expiry_hours == 0 {
            anyhow::bail!("context.expiry_hours must be at least 1");
        }

        let agents = &config.scenario.agents;
        let known = |name: &str| agents.is_empty() || agents.iter().any(|a| a == name);

        if let Some(initial) = &config.scenario.initial_agent {
            if !known(initial) {
                anyhow::bail!("scenario.initial_agent '{}' is not a scenario agent", initial);
            }
        }

        for rule in &config.escalation.rules {
            if !RULE_ACTIONS.contains(&rule.action.to_lowercase().as_str()) {
                anyhow::bail!(
                    "Escalation rule '{}' has invalid action '{}'",
                    rule.trigger,
                    rule.action
                );
            }
            if let Some(target) = &rule.target {
                if !known(target) {
                    anyhow::bail!(
                        "Escalation rule '{}' targets unknown agent '{}'",
                        rule.trigger,
                        target
                    );
                }
            }
        }

        Ok(())
    }

    /// Audit log path with `~` and environment variables expanded.
    pub fn log_file_path(&self) -> Result<Option<PathBuf>> {
        match &self.config.logging.log_file {
            Some(raw) => {
                let expanded = shellexpand::full(raw)
                    .with_context(|| format!("Failed to expand log file path: {}", raw))?;
                Ok(Some(PathBuf::from(expanded.as_ref())))
            }
            None => Ok(None),
        }
    }

    /// Get configuration value by dot-notation key.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match key {
            "escalation.supervisor_agent" => Some(self.config.escalation.supervisor_agent.clone()),
            "scenario.initial_agent" => self.config.scenario.initial_agent.clone(),
            "logging.log_file" => self.config.logging.log_file.clone(),
            "logging.log_level" => Some(self.config.logging.log_level.clone()),
            _ => None,
        }
    }

    /// Get numeric configuration value.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match key {
            "session.loop_window" => Some(self.config.session.loop_window as u64),
            "session.loop_threshold" => Some(self.config.session.loop_threshold as u64),
            "tool_loop.max_iterations" => Some(self.config.tool_loop.max_iterations as u64),
            "context.expiry_hours" => Some(self.config.context.expiry_hours),
            "context.max_snapshots" => Some(self.config.context.max_snapshots as u64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.session.loop_window, 5);
        assert_eq!(config.session.loop_threshold, 3);
        assert_eq!(config.tool_loop.max_iterations, 5);
        assert_eq!(config.context.expiry_hours, 24);
        assert_eq!(config.context.max_snapshots, 50);
        assert_eq!(config.escalation.supervisor_agent, "supervisor");
        assert!(config.escalation.trigger_keywords.contains(&"human".to_string()));
        assert!(config.scenario.agents.is_empty());
        assert!(config.logging.log_file.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let loader = ConfigurationLoader::new(Some(Path::new("does/not/exist.toml"))).unwrap();
        assert_eq!(loader.config, OrchestrationConfig::default());
        assert_eq!(loader.get_u64("tool_loop.max_iterations"), Some(5));
        assert_eq!(
            loader.get_string("escalation.supervisor_agent"),
            Some("supervisor".to_string())
        );
        assert_eq!(loader.get_u64("unknown.key"), None);
    }

    #[test]
    fn test_config_from_toml_file() {
        let toml_content = r#"
[session]
loop_window = 8
loop_threshold = 2

[tool_loop]
max_iterations = 3

[scenario]
agents = ["greeter", "sales", "supervisor"]
initial_agent = "greeter"

[[escalation.rules]]
trigger = "repeated_errors"
action = "escalate"
target = "supervisor"
message = "Escalating {session_id} from {agent}"
when = { error_count_at_least = 3 }

[[escalation.rules]]
trigger = "vip"
action = "handoff"
target = "sales"
when = { variable_equals = { key = "tier", value = "vip" } }
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let loader = ConfigurationLoader::new(Some(temp_file.path())).unwrap();
        let config = &loader.config;
        assert_eq!(config.session.loop_window, 8);
        assert_eq!(config.session.loop_threshold, 2);
        assert_eq!(config.tool_loop.max_iterations, 3);
        // untouched sections keep defaults
        assert_eq!(config.context.max_snapshots, 50);
        assert_eq!(config.escalation.rules.len(), 2);
        assert_eq!(
            config.escalation.rules[0].when,
            RuleConditionConfig::ErrorCountAtLeast(3)
        );
        assert_eq!(
            config.escalation.rules[1].when,
            RuleConditionConfig::VariableEquals {
                key: "tier".to_string(),
                value: "vip".to_string()
            }
        );
    }

    #[test]
    fn test_validation_rejects_unknown_rule_target() {
        let toml_content = r#"
[scenario]
agents = ["greeter", "sales"]

[[escalation.rules]]
trigger = "angry"
action = "escalate"
target = "billing"
when = { last_message_contains = ["angry"] }
"#;
        let err = ConfigurationLoader::from_toml_str(toml_content).unwrap_err();
        assert!(err.to_string().contains("unknown agent 'billing'"));
    }

    #[test]
    fn test_validation_rejects_bad_action_and_bounds() {
        let mut config = OrchestrationConfig::default();
        config.escalation.rules.push(EscalationRuleConfig {
            trigger: "x".to_string(),
            action: "teleport".to_string(),
            target: None,
            message: None,
            when: RuleConditionConfig::MessageCountAtLeast(1),
        });
        assert!(ConfigurationLoader::from_config(config).is_err());

        let mut config = OrchestrationConfig::default();
        config.tool_loop.max_iterations = 0;
        assert!(ConfigurationLoader::from_config(config).is_err());
    }

    #[test]
    fn test_log_file_path_expansion() {
        std::env::set_var("ARK_TEST_LOG_DIR", "/tmp/ark-test");
        let mut config = OrchestrationConfig::default();
        config.logging.log_file = Some("$ARK_TEST_LOG_DIR/audit.md".to_string());
        let loader = ConfigurationLoader::from_config(config).unwrap();
        assert_eq!(
            loader.log_file_path().unwrap(),
            Some(PathBuf::from("/tmp/ark-test/audit.md"))
        );
        std::env::remove_var("ARK_TEST_LOG_DIR");
    }
}
