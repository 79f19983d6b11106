//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to the processor via mpsc
//! 2. **Ticks**: Harvest signals emitted by triggers on a shared mpsc channel
//! 3. **Replies**: oneshot channels for synchronous queries

use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    AgentRunId,
    app::{AppInfo, AppState},
    harvest::TxnData,
};

/// Category of data flushed by a harvest tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestType {
    /// Metrics, errors, slow SQLs and traces
    DefaultData,
    TxnEvents,
    CustomEvents,
    ErrorEvents,
    SpanEvents,
    /// Everything at once (uniform cadence)
    All,
}

impl HarvestType {
    /// Categories that may be given their own report period.
    pub const EVENT_TYPES: [HarvestType; 4] = [
        HarvestType::TxnEvents,
        HarvestType::CustomEvents,
        HarvestType::ErrorEvents,
        HarvestType::SpanEvents,
    ];
}

impl fmt::Display for HarvestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvestType::DefaultData => "default_data",
            HarvestType::TxnEvents => "txn_events",
            HarvestType::CustomEvents => "custom_events",
            HarvestType::ErrorEvents => "error_events",
            HarvestType::SpanEvents => "span_events",
            HarvestType::All => "all",
        };
        f.write_str(s)
    }
}

/// Signal emitted by a harvest trigger: flush `harvest_type` for `run_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestTick {
    pub run_id: AgentRunId,
    pub harvest_type: HarvestType,
}

/// Reply to an app info request.
#[derive(Debug, Clone, PartialEq)]
pub struct AppInfoReply {
    pub state: AppState,
    /// Raw connect reply, present once the app is connected.
    pub connect_reply: Option<Vec<u8>>,
}

/// Errors returned by the processor to its callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("application limit of {0} reached")]
    AppLimitExceeded(usize),
    #[error("processor is not running")]
    Stopped,
}

/// Snapshot of processor counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorStats {
    pub apps: usize,
    pub connected_apps: usize,
    pub txn_data_received: u64,
    pub harvests_sent: u64,
    pub harvests_failed: u64,
    pub connect_attempts: u64,
}

/// Commands that can be sent to the Processor
#[derive(Debug)]
pub enum ProcessorCommand {
    /// Register or refresh an application and report its state
    AppInfo {
        info: Box<AppInfo>,
        respond_to: oneshot::Sender<Result<AppInfoReply, ProcessorError>>,
    },

    /// Aggregate agent data for a connected application
    TxnData { run_id: AgentRunId, data: Box<TxnData> },

    GetStats {
        respond_to: oneshot::Sender<ProcessorStats>,
    },

    /// Cancel every trigger and stop
    Shutdown,
}
