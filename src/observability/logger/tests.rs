use super::*;
use std::collections::BTreeMap;
use tempfile::tempdir;

#[test]
fn test_logger_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("audit.md");

    let logger = Logger::new(Some(&log_path), Some("debug"));
    assert!(logger.is_ok());

    let logger = logger.unwrap();
    assert_eq!(logger.log_file(), &log_path);
    assert_eq!(logger.log_level(), "DEBUG");
}

#[test]
fn test_log_file_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("logs").join("audit.md");

    let _logger = Logger::new(Some(&log_path), None).unwrap();
    assert!(log_path.exists());

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("# Orchestration Audit Log"));
    assert!(content.contains("Log started:"));
}

#[test]
fn test_log_operations() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("audit.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    let mut details = BTreeMap::new();
    details.insert(
        "initial_agent".to_string(),
        serde_json::Value::String("greeter".to_string()),
    );

    assert!(logger.log_session_start("s-1", &details).is_ok());
    assert!(logger
        .log_handoff("completed", "greeter", "sales", "user asked about products")
        .is_ok());
    assert!(logger
        .log_escalation("sales", "supervisor_keywords", "escalate", Some("supervisor"))
        .is_ok());
    assert!(logger
        .log_tool_call("lookup_order", "{\"id\":1}", "timeout", false)
        .is_ok());
    assert!(logger.log_completion("Turn answered").is_ok());

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("## Session Started"));
    assert!(content.contains("**Session:** s-1"));
    assert!(content.contains("**From:** greeter"));
    assert!(content.contains("**To:** sales"));
    assert!(content.contains("**Target:** supervisor"));
    assert!(content.contains("**Error:** timeout"));
    assert!(content.contains("### Session Completed"));
    // Arguments are only written at DEBUG level
    assert!(!content.contains("**Args:**"));
}

#[test]
fn test_debug_level_includes_tool_args() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("audit.md");
    let logger = Logger::new(Some(&log_path), Some("DEBUG")).unwrap();

    logger
        .log_tool_call("lookup_order", "{\"id\":1}", "shipped", true)
        .unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("**Args:**"));
    assert!(content.contains("**Result:** shipped"));
}

#[test]
fn test_error_with_context() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("audit.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    let mut ctx = BTreeMap::new();
    ctx.insert("agent".to_string(), serde_json::json!("sales"));
    logger.log_error("backend unreachable", Some(&ctx)).unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("backend unreachable"));
    assert!(content.contains("\"agent\": \"sales\""));
}
