pub mod actors;
pub mod aggregation;
pub mod api;
pub mod app;
pub mod client;
pub mod collector;
pub mod config;
pub mod harvest;
pub mod limits;
pub mod util;
pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one agent run, handed out by the collector on connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRunId(pub String);

impl AgentRunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentRunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Sampling priority assigned by the agent. Only used to order reservoir
/// eviction, never inspected otherwise.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SamplingPriority(pub f64);

/// A single analytics event: opaque JSON bytes plus its sampling priority.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub data: Vec<u8>,
    pub priority: SamplingPriority,
}

impl AnalyticsEvent {
    pub fn new(data: impl Into<Vec<u8>>, priority: f64) -> Self {
        Self {
            data: data.into(),
            priority: SamplingPriority(priority),
        }
    }
}

/// Build-time version info.
pub mod version {
    pub const NUMBER: &str = env!("CARGO_PKG_VERSION");

    pub fn commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }
}
