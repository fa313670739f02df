//! Message envelope handed from ingestion adapters to the stores.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Step name carried by the control message that closes an operation event.
pub const CALLBACK_STEP: &str = "callback";

/// Log level of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Error => "error",
        }
    }

    /// Lenient parse used at the ingestion boundary. Unknown levels become `Info`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregated monitor row (per request path, port or query key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MonitorEntry {
    pub key: String,
    pub count: u64,
    pub abnormal_count: u64,
    /// Average latency in milliseconds
    pub average_time: f64,
    /// Max latency in milliseconds
    pub max_time: f64,
    /// Total time spent in milliseconds
    pub cumulative_time: f64,
}

/// Monitor payload attached to a sample envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MonitorSample {
    pub entries: Vec<MonitorEntry>,
}

/// Immutable envelope produced by an ingestion adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageEnvelope {
    /// EventID for operation logs, ServiceID for container logs and monitor samples
    pub stream_key: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub content: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSample>,
}

impl MessageEnvelope {
    /// Create a plain log envelope stamped with the current time.
    pub fn new(stream_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            message: message.into(),
            time: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    /// Create a container log envelope carrying raw line bytes.
    pub fn with_content(stream_key: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            stream_key: stream_key.into(),
            content: content.into(),
            time: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    /// Create a monitor sample envelope reported by `host_name`.
    pub fn monitor_sample(
        stream_key: impl Into<String>,
        host_name: impl Into<String>,
        entries: Vec<MonitorEntry>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            host_name: host_name.into(),
            time: chrono::Utc::now().to_rfc3339(),
            monitor: Some(MonitorSample { entries }),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_step(mut self, step: impl Into<String>, status: impl Into<String>) -> Self {
        self.step = step.into();
        self.status = status.into();
        self
    }

    /// Envelopes without a stream key are dropped at the insert boundary.
    pub fn has_stream_key(&self) -> bool {
        !self.stream_key.trim().is_empty()
    }

    /// The control message that finalizes an operation event.
    pub fn is_callback(&self) -> bool {
        self.step == CALLBACK_STEP
    }

    /// Render as a single history line.
    pub fn render(&self) -> String {
        if !self.content.is_empty() {
            return String::from_utf8_lossy(&self.content).into_owned();
        }
        format!("{} {} {}", self.time, self.level, self.message)
    }
}
