//! Metric table
//!
//! Metrics are keyed by `(name, scope)`. Repeated observations of the same key
//! are folded together (count, total, exclusive, min, max, sum of squares).
//! Once the table holds `max_table_size` entries, new unforced names are
//! dropped and counted; existing keys keep accumulating and forced metrics
//! are always inserted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::{PayloadCreator, PayloadResult};
use crate::{AgentRunId, collector, harvest::Harvest, limits};

/// Whether a metric may be dropped when the table is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricForce {
    /// Always inserted, never dropped.
    Forced,
    /// Subject to the table limit.
    Unforced,
}

/// Aggregated values for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricData {
    pub count: f64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
}

impl MetricData {
    pub fn from_count(count: f64) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    pub fn from_duration(duration: f64, exclusive: f64) -> Self {
        Self {
            count: 1.0,
            total: duration,
            exclusive,
            min: duration,
            max: duration,
            sum_squares: duration * duration,
        }
    }

    /// Agent wire order: `[count, total, exclusive, min, max, sum_squares]`.
    pub fn from_array(values: [f64; 6]) -> Self {
        let [count, total, exclusive, min, max, sum_squares] = values;
        Self {
            count,
            total,
            exclusive,
            min,
            max,
            sum_squares,
        }
    }

    pub fn as_array(&self) -> [f64; 6] {
        [
            self.count,
            self.total,
            self.exclusive,
            self.min,
            self.max,
            self.sum_squares,
        ]
    }

    pub fn aggregate(&mut self, other: &MetricData) {
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.sum_squares += other.sum_squares;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct MetricId {
    name: String,
    scope: String,
}

#[derive(Debug, Clone)]
struct Metric {
    data: MetricData,
    force: MetricForce,
}

/// Metric accumulator for one harvest window.
#[derive(Debug)]
pub struct MetricTable {
    metrics: HashMap<MetricId, Metric>,
    max_table_size: usize,
    num_dropped: u64,
    window_start: DateTime<Utc>,
    failed_harvests: u32,
}

impl MetricTable {
    pub fn new(max_table_size: usize, window_start: DateTime<Utc>) -> Self {
        Self {
            metrics: HashMap::new(),
            max_table_size,
            num_dropped: 0,
            window_start,
            failed_harvests: 0,
        }
    }

    pub fn add(&mut self, name: &str, scope: &str, data: MetricData, force: MetricForce) {
        let id = MetricId {
            name: name.to_string(),
            scope: scope.to_string(),
        };

        if let Some(existing) = self.metrics.get_mut(&id) {
            existing.data.aggregate(&data);
            return;
        }

        if force == MetricForce::Unforced && self.metrics.len() >= self.max_table_size {
            self.num_dropped += 1;
            return;
        }

        self.metrics.insert(id, Metric { data, force });
    }

    pub fn add_count(&mut self, name: &str, scope: &str, count: f64, force: MetricForce) {
        self.add(name, scope, MetricData::from_count(count), force);
    }

    pub fn add_duration(
        &mut self,
        name: &str,
        scope: &str,
        duration: f64,
        exclusive: f64,
        force: MetricForce,
    ) {
        self.add(
            name,
            scope,
            MetricData::from_duration(duration, exclusive),
            force,
        );
    }

    pub fn get(&self, name: &str, scope: &str) -> Option<&MetricData> {
        self.metrics
            .get(&MetricId {
                name: name.to_string(),
                scope: scope.to_string(),
            })
            .map(|m| &m.data)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Number of distinct metrics rejected because the table was full.
    pub fn num_dropped(&self) -> u64 {
        self.num_dropped
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Fold a table from a failed send into this one.
    fn merge_failed(&mut self, from: MetricTable) {
        if from.window_start < self.window_start {
            self.window_start = from.window_start;
        }
        self.failed_harvests = from.failed_harvests;

        for (id, metric) in from.metrics {
            self.add(&id.name, &id.scope, metric.data, metric.force);
        }
    }

    fn sorted(&self) -> Vec<(&MetricId, &Metric)> {
        let mut entries: Vec<_> = self.metrics.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl PayloadCreator for MetricTable {
    fn is_empty(&self) -> bool {
        MetricTable::is_empty(self)
    }

    /// `[run_id, window_start, harvest_start, [[{"name","scope"}, [values]], ...]]`
    fn data(&self, run_id: &AgentRunId, harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>> {
        let metrics: Vec<_> = self
            .sorted()
            .into_iter()
            .map(|(id, metric)| {
                let key = if id.scope.is_empty() {
                    json!({ "name": id.name })
                } else {
                    json!({ "name": id.name, "scope": id.scope })
                };
                json!([key, metric.data.as_array()])
            })
            .collect();

        let payload = json!([
            run_id,
            self.window_start.timestamp(),
            harvest_start.timestamp(),
            metrics,
        ]);

        Ok(serde_json::to_vec(&payload)?)
    }

    fn failed_harvest(self: Box<Self>, harvest: &mut Harvest) {
        let mut table = *self;
        table.failed_harvests += 1;

        if table.failed_harvests >= limits::FAILED_METRIC_ATTEMPTS_LIMIT {
            warn!(
                "discarding {} metrics after {} failed harvests",
                table.len(),
                table.failed_harvests
            );
            return;
        }

        debug!("merging {} metrics into next harvest", table.len());
        harvest.metrics.merge_failed(table);
    }

    fn cmd(&self) -> &'static str {
        collector::COMMAND_METRICS
    }
}
