//! Pattern-based parser for tunnel engine output
//!
//! Maps engine stdout/stderr lines to log levels and, where a line marks
//! readiness or failure, to `EngineEvent`s.

use crate::engine::{EngineEvent, EngineStatus, LogLevel};
use regex::Regex;

/// Result of parsing one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub level: LogLevel,
    pub message: String,
    /// Status or error event implied by the line, if any
    pub event: Option<EngineEvent>,
}

/// Parser for engine output
pub struct OutputParser {
    /// Line announcing the tunnel is up
    ready_pattern: Regex,
    /// Line after which the engine cannot recover
    fatal_pattern: Regex,
    /// Recoverable connection failure
    error_pattern: Regex,
}

impl OutputParser {
    /// Compile the parser from configured patterns
    pub fn new(ready: &str, fatal: &str, error: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            ready_pattern: Regex::new(ready)?,
            fatal_pattern: Regex::new(fatal)?,
            error_pattern: Regex::new(error)?,
        })
    }

    /// Split a `LEVEL[tag] message` line into level and message
    pub fn split_level(line: &str) -> (LogLevel, String) {
        let trimmed = line.trim();
        for (prefix, level) in [
            ("FATAL", LogLevel::Error),
            ("PANIC", LogLevel::Error),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Debug),
        ] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                return (level, strip_tag(rest));
            }
        }
        (LogLevel::Info, trimmed.to_string())
    }

    /// Parse one line of engine output
    ///
    /// Returns `None` for blank lines.
    pub fn parse_line(&self, line: &str) -> Option<ParsedLine> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (level, message) = Self::split_level(trimmed);

        let event = if self.fatal_pattern.is_match(trimmed) {
            Some(EngineEvent::ConnectionError {
                message: message.clone(),
                fatal: true,
            })
        } else if self.error_pattern.is_match(trimmed) {
            Some(EngineEvent::ConnectionError {
                message: message.clone(),
                fatal: false,
            })
        } else if self.ready_pattern.is_match(trimmed) {
            Some(EngineEvent::StatusChanged {
                status: EngineStatus::Connected,
            })
        } else {
            None
        };

        Some(ParsedLine {
            level,
            message,
            event,
        })
    }
}

fn strip_tag(rest: &str) -> String {
    if rest.starts_with('[') {
        if let Some(end) = rest.find(']') {
            return rest[end + 1..].trim().to_string();
        }
    }
    rest.trim().to_string()
}
