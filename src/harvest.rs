//! One generation of aggregation containers for a connected app.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

use crate::actors::messages::HarvestType;
use crate::aggregation::{
    ErrorHeap, EventKind, EventReservoir, MetricData, MetricForce, MetricTable, PayloadCreator,
    SlowSql, SlowSqls, TracedError, TxnTrace, TxnTraces,
};
use crate::app::MetricRules;
use crate::{AnalyticsEvent, limits};

/// A metric as reported by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentMetric {
    pub name: String,
    #[serde(default)]
    pub scope: String,
    /// `[count, total, exclusive, min, max, sum_squares]`
    pub data: [f64; 6],
    #[serde(default)]
    pub forced: bool,
}

/// An event as reported by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEvent {
    #[serde(default)]
    pub priority: f64,
    pub data: serde_json::Value,
}

/// A traced error as reported by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentError {
    #[serde(default)]
    pub priority: i64,
    pub data: serde_json::Value,
}

/// Data collected by an agent for one or more transactions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxnData {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub metrics: Vec<AgentMetric>,
    #[serde(default)]
    pub txn_events: Vec<AgentEvent>,
    #[serde(default)]
    pub custom_events: Vec<AgentEvent>,
    #[serde(default)]
    pub error_events: Vec<AgentEvent>,
    #[serde(default)]
    pub span_events: Vec<AgentEvent>,
    #[serde(default)]
    pub errors: Vec<AgentError>,
    #[serde(default)]
    pub slow_sqls: Vec<SlowSql>,
    #[serde(default)]
    pub traces: Vec<TxnTrace>,
}

#[derive(Debug)]
pub struct Harvest {
    pub metrics: MetricTable,
    pub errors: ErrorHeap,
    pub slow_sqls: SlowSqls,
    pub txn_traces: TxnTraces,
    pub txn_events: EventReservoir,
    pub custom_events: EventReservoir,
    pub error_events: EventReservoir,
    pub span_events: EventReservoir,
    pid_set: HashSet<u32>,
}

impl Harvest {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            metrics: MetricTable::new(limits::MAX_METRICS, now),
            errors: ErrorHeap::new(limits::MAX_ERRORS),
            slow_sqls: SlowSqls::new(limits::MAX_SLOW_SQLS),
            txn_traces: TxnTraces::new(),
            txn_events: EventReservoir::new(EventKind::Txn, limits::MAX_TXN_EVENTS),
            custom_events: EventReservoir::new(EventKind::Custom, limits::MAX_CUSTOM_EVENTS),
            error_events: EventReservoir::new(EventKind::Error, limits::MAX_ERROR_EVENTS),
            span_events: EventReservoir::new(EventKind::Span, limits::MAX_SPAN_EVENTS),
            pid_set: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pid_set.is_empty()
            && self.custom_events.is_empty()
            && self.error_events.is_empty()
            && self.span_events.is_empty()
            && self.errors.is_empty()
            && self.metrics.is_empty()
            && self.slow_sqls.is_empty()
            && self.txn_events.is_empty()
            && self.txn_traces.is_empty()
    }

    pub fn observe_pid(&mut self, pid: u32) {
        self.pid_set.insert(pid);
    }

    pub fn reservoir_mut(&mut self, kind: EventKind) -> &mut EventReservoir {
        match kind {
            EventKind::Txn => &mut self.txn_events,
            EventKind::Custom => &mut self.custom_events,
            EventKind::Error => &mut self.error_events,
            EventKind::Span => &mut self.span_events,
        }
    }

    /// Fold agent data into the containers, renaming metrics with `rules`.
    pub fn aggregate(&mut self, data: TxnData, rules: &MetricRules) {
        if let Some(pid) = data.pid {
            self.observe_pid(pid);
        }

        for metric in data.metrics {
            let Some(name) = rules.apply(&metric.name) else {
                trace!("metric {} ignored by rename rules", metric.name);
                continue;
            };
            let force = if metric.forced {
                MetricForce::Forced
            } else {
                MetricForce::Unforced
            };
            self.metrics.add(
                &name,
                &metric.scope,
                MetricData::from_array(metric.data),
                force,
            );
        }

        let events = [
            (EventKind::Txn, data.txn_events),
            (EventKind::Custom, data.custom_events),
            (EventKind::Error, data.error_events),
            (EventKind::Span, data.span_events),
        ];
        for (kind, events) in events {
            let reservoir = self.reservoir_mut(kind);
            for event in events {
                reservoir.add_event(AnalyticsEvent::new(event.data.to_string(), event.priority));
            }
        }

        for error in data.errors {
            self.errors
                .add_error(TracedError::new(error.priority, error.data.to_string().into_bytes()));
        }

        for sql in data.slow_sqls {
            self.slow_sqls.observe(sql);
        }

        for trace in data.traces {
            self.txn_traces.add_txn_trace(trace);
        }
    }

    /// Add the supportability metrics describing this window. Does nothing
    /// for an empty harvest so that inactivity stays visible upstream.
    pub fn create_final_metrics(&mut self) {
        if self.is_empty() {
            return;
        }

        // Instance/Reporting must be nonzero.
        let pids = self.pid_set.len().max(1) as f64;
        let forced = MetricForce::Forced;

        self.metrics.add_count("Instance/Reporting", "", pids, forced);

        let supportability = [
            (
                "Supportability/Events/Customer/Seen",
                "Supportability/Events/Customer/Sent",
                &self.custom_events,
            ),
            (
                "Supportability/AnalyticsEvents/TotalEventsSeen",
                "Supportability/AnalyticsEvents/TotalEventsSent",
                &self.txn_events,
            ),
            (
                "Supportability/Events/TransactionError/Seen",
                "Supportability/Events/TransactionError/Sent",
                &self.error_events,
            ),
            (
                "Supportability/SpanEvent/TotalEventsSeen",
                "Supportability/SpanEvent/TotalEventsSent",
                &self.span_events,
            ),
        ];
        for (seen, sent, reservoir) in supportability {
            self.metrics
                .add_count(seen, "", reservoir.num_seen() as f64, forced);
            self.metrics
                .add_count(sent, "", reservoir.num_saved() as f64, forced);
        }

        let dropped = self.metrics.num_dropped();
        if dropped > 0 {
            self.metrics
                .add_count("Supportability/MetricsDropped", "", dropped as f64, forced);
        }
    }

    /// Detach the containers belonging to `harvest_type`, replacing them with
    /// fresh ones. Empty containers are not returned.
    pub fn take_payloads(
        &mut self,
        harvest_type: HarvestType,
        now: DateTime<Utc>,
    ) -> Vec<Box<dyn PayloadCreator>> {
        let mut payloads: Vec<Box<dyn PayloadCreator>> = Vec::new();

        match harvest_type {
            HarvestType::All => {
                self.create_final_metrics();
                self.take_default_data(now, &mut payloads);
                for kind in [EventKind::Txn, EventKind::Custom, EventKind::Error, EventKind::Span] {
                    payloads.push(Box::new(self.take_reservoir(kind)));
                }
            }
            HarvestType::DefaultData => {
                self.create_final_metrics();
                self.take_default_data(now, &mut payloads);
            }
            HarvestType::TxnEvents => payloads.push(Box::new(self.take_reservoir(EventKind::Txn))),
            HarvestType::CustomEvents => {
                payloads.push(Box::new(self.take_reservoir(EventKind::Custom)))
            }
            HarvestType::ErrorEvents => {
                payloads.push(Box::new(self.take_reservoir(EventKind::Error)))
            }
            HarvestType::SpanEvents => payloads.push(Box::new(self.take_reservoir(EventKind::Span))),
        }

        payloads.retain(|p| !p.is_empty());
        payloads
    }

    fn take_default_data(&mut self, now: DateTime<Utc>, out: &mut Vec<Box<dyn PayloadCreator>>) {
        let metrics = std::mem::replace(
            &mut self.metrics,
            MetricTable::new(limits::MAX_METRICS, now),
        );
        let errors = std::mem::replace(&mut self.errors, ErrorHeap::new(limits::MAX_ERRORS));
        let slow_sqls = std::mem::replace(
            &mut self.slow_sqls,
            SlowSqls::new(limits::MAX_SLOW_SQLS),
        );
        let txn_traces = std::mem::take(&mut self.txn_traces);
        self.pid_set.clear();

        out.push(Box::new(metrics));
        out.push(Box::new(errors));
        out.push(Box::new(slow_sqls));
        out.push(Box::new(txn_traces));
    }

    fn take_reservoir(&mut self, kind: EventKind) -> EventReservoir {
        std::mem::replace(
            self.reservoir_mut(kind),
            EventReservoir::new(kind, kind.max_events()),
        )
    }
}
