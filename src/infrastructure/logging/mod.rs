//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - Pretty or JSON console output
//! - JSON log files with rotation in the run directory

pub mod logger;

pub use logger::{parse_log_level, LoggerImpl};
