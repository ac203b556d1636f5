//! Result log record format.
//!
//! One record per update attempt, one line per record:
//! `name;code;info[|durationMs]\n`.

use crate::error::{ErrorCode, Result, UpdateError};
use serde::{Deserialize, Serialize};

/// A single result-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// hmp (or module package path) the record is about
    pub name: String,
    /// Raw result code
    pub code: i32,
    /// Free-form text; must not contain newlines
    pub info: String,
    /// Duration of the attempt, when measured
    pub duration_ms: Option<u64>,
}

impl ResultRecord {
    pub fn new(name: impl Into<String>, code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.as_i32(),
            info: info.into(),
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_i32(self.code)
    }

    /// Render as a log line, including the trailing newline.
    pub fn to_line(&self) -> String {
        let info = sanitize(&self.info);
        match self.duration_ms {
            Some(ms) => format!("{};{};{}|{}\n", sanitize(&self.name), self.code, info, ms),
            None => format!("{};{};{}\n", sanitize(&self.name), self.code, info),
        }
    }

    /// Parse one line (with or without the trailing newline).
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut parts = line.splitn(3, ';');
        let name = parts.next().unwrap_or_default();
        let code = parts
            .next()
            .ok_or_else(|| UpdateError::Format(format!("result record without code: '{}'", line)))?;
        let rest = parts.next().unwrap_or_default();

        if name.is_empty() {
            return Err(UpdateError::Format(format!(
                "result record without name: '{}'",
                line
            )));
        }
        let code = code
            .trim()
            .parse::<i32>()
            .map_err(|_| UpdateError::Format(format!("invalid result code in '{}'", line)))?;

        let (info, duration_ms) = match rest.rsplit_once('|') {
            Some((info, ms)) => match ms.parse::<u64>() {
                Ok(ms) => (info.to_string(), Some(ms)),
                Err(_) => (rest.to_string(), None),
            },
            None => (rest.to_string(), None),
        };

        Ok(Self {
            name: name.to_string(),
            code,
            info,
            duration_ms,
        })
    }
}

/// Separators inside a field would corrupt the line format.
fn sanitize(field: &str) -> String {
    field.replace(['\n', '\r'], " ").replace(';', ",")
}
