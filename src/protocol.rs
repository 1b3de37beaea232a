//! Wire types shared by the server and its clients.
//!
//! Everything that crosses HTTP is JSON. Output frames on the event stream
//! carry a serialized [`OutputMessage`]; the control routes use the request
//! and response structs below.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

/// Where a piece of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    /// Messages produced by the server itself (lifecycle notices).
    System,
    Error,
}

/// Severity attached to an output line.
///
/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

static LEVEL_PATTERNS: LazyLock<[(Regex, LogLevel); 3]> = LazyLock::new(|| {
    let pattern = |re: &str| Regex::new(re).expect("level pattern is a valid regex");
    [
        (pattern(r"(?i)\[error\]|error:"), LogLevel::Error),
        (pattern(r"(?i)\[warn\]|warning:"), LogLevel::Warn),
        (pattern(r"(?i)\[debug\]|debug:"), LogLevel::Debug),
    ]
});

impl LogLevel {
    /// Infer a level from the text of a line.
    ///
    /// Looks for `[error]`/`error:`, then `[warn]`/`warning:`, then
    /// `[debug]`/`debug:` (case-insensitive). Anything else is `Info`.
    #[must_use]
    pub fn infer(data: &str) -> Self {
        LEVEL_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(data))
            .map_or(Self::Info, |(_, level)| *level)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One unit of observed agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    /// Text payload, may contain ANSI escape codes.
    pub data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

impl OutputMessage {
    /// Create a message stamped with the current time.
    ///
    /// `Error` messages are always at `LogLevel::Error`; every other kind gets
    /// a level inferred from its text.
    pub fn new(kind: OutputKind, data: impl Into<String>) -> Self {
        let data = data.into();
        let level = match kind {
            OutputKind::Error => LogLevel::Error,
            _ => LogLevel::infer(&data),
        };
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            level: Some(level),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(OutputKind::Stdout, data)
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::new(OutputKind::Stderr, data)
    }

    pub fn system(data: impl Into<String>) -> Self {
        Self::new(OutputKind::System, data)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, data)
    }

    /// The explicit level, or the one inferred from `data` when absent.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level.unwrap_or_else(|| LogLevel::infer(&self.data))
    }
}

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    #[default]
    Stopped,
    Starting,
    Stopping,
    Error,
}

impl AgentStatus {
    /// Whether output is (or is about to be) produced.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Payload of the `connected` control event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedEvent {
    pub status: AgentStatus,
    pub job_id: Option<String>,
}

/// Body of `POST /agents/{id}/stream` on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInputResponse {
    pub success: bool,
    pub agent_id: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// Error body returned by every route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An agent from the catalogue together with its live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub status: AgentStatus,
    pub command: String,
    pub args: Vec<String>,
    pub env_required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentInfo>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: AgentInfo,
    pub timestamp: DateTime<Utc>,
}

/// Optional body of `POST /agents/{id}/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    pub job_id: String,
    pub agent_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Optional body of `POST /agents/{id}/stop`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    pub agent_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /agents/{id}/output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub agent_id: String,
    pub messages: Vec<OutputMessage>,
}
