// src/types.rs

//! Small shared enums and value parsers.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-query status within one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

/// Overall status of a persisted analysis run.
///
/// `Success`, `Error` and `Partial` are terminal; a new run supersedes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    #[default]
    Queued,
    Running,
    Success,
    Error,
    Partial,
}

impl AnalysisStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Success | AnalysisStatus::Error | AnalysisStatus::Partial
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Success => "success",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(AnalysisStatus::Queued),
            "running" => Ok(AnalysisStatus::Running),
            "success" => Ok(AnalysisStatus::Success),
            "error" => Ok(AnalysisStatus::Error),
            "partial" => Ok(AnalysisStatus::Partial),
            other => Err(format!("invalid analysis status: {other}")),
        }
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

/// Decode one line read from a child process, without its line terminator.
///
/// Invalid UTF-8 is replaced rather than rejected, so a stray byte costs one
/// garbled line instead of the whole stream.
pub fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes)
}
