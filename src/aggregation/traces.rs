//! Transaction traces

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{PayloadCreator, PayloadResult};
use crate::{AgentRunId, collector, harvest::Harvest, limits};

/// A transaction trace. `data` is the agent-encoded trace and is forwarded
/// unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TxnTrace {
    pub duration_millis: u64,
    #[serde(default)]
    pub force_persist: bool,
    #[serde(default)]
    pub synthetics: bool,
    pub data: serde_json::Value,
}

/// Holds the slowest regular trace plus bounded sets of forced and
/// synthetics traces.
#[derive(Debug, Default)]
pub struct TxnTraces {
    regular: Option<TxnTrace>,
    force_persisted: Vec<TxnTrace>,
    synthetics: Vec<TxnTrace>,
}

impl TxnTraces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txn_trace(&mut self, trace: TxnTrace) {
        if trace.synthetics && self.synthetics.len() < limits::MAX_SYNTHETICS_TRACES {
            self.synthetics.push(trace);
            return;
        }
        if trace.force_persist && self.force_persisted.len() < limits::MAX_FORCE_PERSIST_TRACES {
            self.force_persisted.push(trace);
            return;
        }

        // Everything else competes for the single regular slot.
        let slower = self
            .regular
            .as_ref()
            .is_none_or(|current| trace.duration_millis > current.duration_millis);
        if slower {
            self.regular = Some(trace);
        }
    }

    pub fn num_saved(&self) -> u64 {
        (self.regular.iter().count() + self.force_persisted.len() + self.synthetics.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.num_saved() == 0
    }

    fn traces(&self) -> impl Iterator<Item = &TxnTrace> {
        self.regular
            .iter()
            .chain(self.force_persisted.iter())
            .chain(self.synthetics.iter())
    }
}

impl PayloadCreator for TxnTraces {
    fn is_empty(&self) -> bool {
        TxnTraces::is_empty(self)
    }

    /// `[run_id, [trace, ...]]`
    fn data(&self, run_id: &AgentRunId, _harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>> {
        let traces: Vec<_> = self.traces().map(|t| &t.data).collect();
        Ok(serde_json::to_vec(&json!([run_id, traces]))?)
    }

    fn failed_harvest(self: Box<Self>, _harvest: &mut Harvest) {
        debug!("dropping {} traces after failed harvest", self.num_saved());
    }

    fn cmd(&self) -> &'static str {
        collector::COMMAND_TRACES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(duration_millis: u64) -> TxnTrace {
        TxnTrace {
            duration_millis,
            force_persist: false,
            synthetics: false,
            data: json!([duration_millis]),
        }
    }

    #[test]
    fn test_keeps_slowest_regular_trace() {
        let mut traces = TxnTraces::new();
        traces.add_txn_trace(trace(10));
        traces.add_txn_trace(trace(30));
        traces.add_txn_trace(trace(20));

        assert_eq!(traces.num_saved(), 1);
        assert_eq!(traces.regular.as_ref().unwrap().duration_millis, 30);
    }

    #[test]
    fn test_forced_and_synthetics_are_bounded() {
        let mut traces = TxnTraces::new();

        for _ in 0..15 {
            let mut forced = trace(1);
            forced.force_persist = true;
            traces.add_txn_trace(forced);
        }
        for _ in 0..25 {
            let mut synthetic = trace(1);
            synthetic.synthetics = true;
            traces.add_txn_trace(synthetic);
        }

        assert_eq!(traces.force_persisted.len(), limits::MAX_FORCE_PERSIST_TRACES);
        assert_eq!(traces.synthetics.len(), limits::MAX_SYNTHETICS_TRACES);
        // overflow competes for the regular slot
        assert!(traces.regular.is_some());
    }

    #[test]
    fn test_data_format() {
        let mut traces = TxnTraces::new();
        assert!(traces.is_empty());
        traces.add_txn_trace(trace(42));

        let bytes = traces.data(&AgentRunId::from("run"), Utc::now()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value, json!(["run", [[42]]]));
        assert_eq!(traces.cmd(), "transaction_sample_data");
    }
}
