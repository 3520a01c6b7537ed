//! Environment variable loading and management.
//!
//! Only host-level settings live here: where the TOML file is and how
//! verbose the audit trail should be.

use std::env;
use std::path::{Path, PathBuf};

/// Loads environment variables from .env file and system environment.
#[derive(Debug, Clone)]
pub struct EnvironmentLoader {
    env_file: Option<String>,
}

impl EnvironmentLoader {
    /// Initialize the environment loader.
    ///
    /// # Arguments
    /// * `env_file` - Path to .env file. Only an explicit path is loaded.
    pub fn new(env_file: Option<&Path>) -> Self {
        // Loading an implicit ./.env would leak repository settings into tests.
        if let Some(path) = env_file {
            if path.exists() {
                if let Err(e) = dotenv::from_path(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to load .env file");
                }
            }
        }

        Self {
            env_file: env_file.map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// The .env file this loader was created with, if any.
    pub fn env_file(&self) -> Option<&str> {
        self.env_file.as_deref()
    }

    /// Config file location from `ARK_CONFIG`.
    pub fn config_path(&self) -> Option<PathBuf> {
        env::var("ARK_CONFIG").ok().map(PathBuf::from)
    }

    /// Audit log level override from `ARK_LOG_LEVEL`.
    pub fn log_level(&self) -> Option<String> {
        env::var("ARK_LOG_LEVEL").ok()
    }

    /// Audit log file override from `ARK_LOG_FILE`.
    pub fn log_file(&self) -> Option<String> {
        env::var("ARK_LOG_FILE").ok()
    }
}

impl Default for EnvironmentLoader {
    fn default() -> Self {
        Self::new(None)
    }
}
