//! Observability utilities for multi-agent orchestration.
//!
//! Diagnostics are emitted through `tracing`; this module adds a durable
//! markdown audit trail that an [`EventLog`](crate::orchestration::EventLog)
//! can mirror every orchestration event into.
//!
//! # Example
//!
//! ```no_run
//! use ark::observability::Logger;
//! use std::collections::BTreeMap;
//!
//! let logger = Logger::new(None, Some("DEBUG")).unwrap();
//!
//! logger.log_session_start("session-1", &BTreeMap::new()).unwrap();
//! logger.log_handoff("completed", "greeter", "sales", "product question").unwrap();
//! logger.log_completion("Turn answered").unwrap();
//! ```

pub mod logger;

pub use logger::Logger;
