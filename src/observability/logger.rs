//! Markdown audit trail for orchestration activity.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One markdown section: a heading, `**Label:** value` lines and optional blocks
struct Entry {
    text: String,
}

impl Entry {
    fn new(depth: usize, title: &str) -> Self {
        Self {
            text: format!("{} {} - {}\n\n", "#".repeat(depth), title, Utc::now().to_rfc3339()),
        }
    }

    fn field(mut self, label: &str, value: impl std::fmt::Display) -> Self {
        self.text.push_str(&format!("**{}:** {}\n", label, value));
        self
    }

    fn json(mut self, label: &str, value: &BTreeMap<String, serde_json::Value>) -> Self {
        let rendered = serde_json::to_string_pretty(value).unwrap_or_default();
        self.text.push_str(&format!("**{}:** {}\n", label, rendered));
        self
    }

    fn code(mut self, label: &str, body: &str) -> Self {
        self.text
            .push_str(&format!("**{}:**\n```json\n{}\n```\n", label, body));
        self
    }

    fn separator(mut self) -> Self {
        self.text.push_str("\n---\n");
        self
    }

    fn finish(mut self) -> String {
        self.text.push('\n');
        self.text
    }
}

/// File-backed audit logger.
///
/// Every entry is appended as a markdown section so the file reads as a
/// transcript of handoffs, escalations and tool calls. Diagnostics go
/// through `tracing`; the file is the durable record.
#[derive(Debug)]
pub struct Logger {
    log_file: PathBuf,
    log_level: String,
}

impl Logger {
    /// Open or create an audit file.
    ///
    /// # Arguments
    /// * `log_file` - Target file. If None, a timestamped file is created under `<tmp>/ark-logs`.
    /// * `log_level` - "INFO" unless given; "DEBUG" also records tool arguments.
    pub fn new(log_file: Option<&Path>, log_level: Option<&str>) -> Result<Self> {
        let log_file = log_file.map(Path::to_path_buf).unwrap_or_else(|| {
            std::env::temp_dir().join("ark-logs").join(format!(
                "relay_{}_{}.md",
                Utc::now().timestamp_millis(),
                std::process::id()
            ))
        });

        if let Some(dir) = log_file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create audit log directory {}", dir.display()))?;
        }

        let logger = Self {
            log_file,
            log_level: log_level.unwrap_or("INFO").to_uppercase(),
        };

        if !logger.log_file.exists() {
            logger.append(&format!(
                "# Orchestration Audit Log\n\nLog started: {}\n\n---\n\n",
                Utc::now().to_rfc3339()
            ))?;
        }

        Ok(logger)
    }

    fn append(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Cannot open audit log {}", self.log_file.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Cannot write audit log {}", self.log_file.display()))
    }

    fn write(&self, entry: Entry) -> Result<()> {
        self.append(&entry.finish())
    }

    /// Log session start with extra details (user, initial agent, ...).
    pub fn log_session_start(
        &self,
        session_id: &str,
        details: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.write(
            Entry::new(2, "Session Started")
                .field("Session", session_id)
                .json("Details", details),
        )?;
        tracing::info!(session_id, "audit session started");
        Ok(())
    }

    /// Agent lifecycle marker such as "Start".
    pub fn log_agent(&self, agent: &str, phase: &str) -> Result<()> {
        self.write(Entry::new(3, &format!("Agent {}", phase)).field("Agent", agent))
    }

    /// Handoff step; `phase` is "requested" or "completed".
    pub fn log_handoff(&self, phase: &str, source: &str, target: &str, trigger: &str) -> Result<()> {
        self.write(
            Entry::new(3, &format!("Handoff {}", phase))
                .field("From", source)
                .field("To", target)
                .field("Trigger", trigger),
        )
    }

    pub fn log_escalation(
        &self,
        agent: &str,
        trigger: &str,
        action: &str,
        target: Option<&str>,
    ) -> Result<()> {
        self.write(
            Entry::new(3, "Escalation")
                .field("Agent", agent)
                .field("Trigger", trigger)
                .field("Action", action)
                .field("Target", target.unwrap_or("-")),
        )
    }

    /// Tool execution. Arguments are written at DEBUG level only.
    pub fn log_tool_call(
        &self,
        tool_name: &str,
        tool_args: &str,
        result: &str,
        success: bool,
    ) -> Result<()> {
        let mut entry = Entry::new(3, "Tool Call")
            .field("Tool", tool_name)
            .field(if success { "Result" } else { "Error" }, result);
        if self.log_level == "DEBUG" && !tool_args.is_empty() {
            entry = entry.code("Args", tool_args);
        }
        self.write(entry)
    }

    pub fn log_error(
        &self,
        error: &str,
        context: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> Result<()> {
        let mut entry = Entry::new(3, "Error").field("Error", error);
        if let Some(ctx) = context {
            entry = entry.json("Context", ctx);
        }
        self.write(entry)
    }

    /// Close a unit of work with a reason.
    pub fn log_completion(&self, reason: &str) -> Result<()> {
        self.write(
            Entry::new(3, "Session Completed")
                .field("Reason", reason)
                .separator(),
        )?;
        tracing::info!(reason, "audit completion");
        Ok(())
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[cfg(test)]
mod tests;
