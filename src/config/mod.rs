//! Configuration management for multi-agent orchestration.
//!
//! Settings are read from a TOML file and host-level overrides from a
//! `.env` file or the process environment.
//!
//! # Example
//!
//! ```no_run
//! use ark::config::{ConfigurationLoader, EnvironmentLoader};
//!
//! let env = EnvironmentLoader::new(None);
//! let loader = ConfigurationLoader::new(env.config_path().as_deref()).unwrap();
//!
//! println!("Max iterations: {}", loader.config.tool_loop.max_iterations);
//! println!("Loop window: {}", loader.config.session.loop_window);
//! ```

pub mod config;
pub mod environment;

pub use self::config::{
    ConfigurationLoader, ContextConfig, EscalationConfig, EscalationRuleConfig, LoggingConfig,
    OrchestrationConfig, RuleConditionConfig, ScenarioConfig, SessionConfig, ToolLoopConfig,
};
pub use self::environment::EnvironmentLoader;
