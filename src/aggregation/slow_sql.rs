//! Slow SQL aggregation, keyed by query id.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{PayloadCreator, PayloadResult};
use crate::{AgentRunId, collector, harvest::Harvest};

/// Aggregated statistics for one distinct query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SlowSql {
    pub id: u64,
    #[serde(default = "default_count")]
    pub count: u64,
    pub total_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub metric_name: String,
    pub query: String,
    #[serde(default)]
    pub txn_name: String,
    #[serde(default)]
    pub txn_url: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_count() -> u64 {
    1
}

impl SlowSql {
    fn aggregate(&mut self, other: SlowSql) {
        self.count = self.count.saturating_add(other.count);
        self.total_micros = self.total_micros.saturating_add(other.total_micros);
        self.min_micros = self.min_micros.min(other.min_micros);

        // The slowest instance provides the details shown to users.
        if other.max_micros > self.max_micros {
            self.max_micros = other.max_micros;
            self.metric_name = other.metric_name;
            self.query = other.query;
            self.txn_name = other.txn_name;
            self.txn_url = other.txn_url;
            self.params = other.params;
        }
    }
}

fn micros_to_millis(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

/// The slowest distinct queries of a harvest window.
#[derive(Debug)]
pub struct SlowSqls {
    max_slow_sqls: usize,
    slow_sqls: Vec<SlowSql>,
}

impl SlowSqls {
    pub fn new(max_slow_sqls: usize) -> Self {
        Self {
            max_slow_sqls,
            slow_sqls: Vec::new(),
        }
    }

    pub fn observe(&mut self, sql: SlowSql) {
        if let Some(existing) = self.slow_sqls.iter_mut().find(|s| s.id == sql.id) {
            existing.aggregate(sql);
            return;
        }

        if self.slow_sqls.len() < self.max_slow_sqls {
            self.slow_sqls.push(sql);
            return;
        }

        let fastest = self
            .slow_sqls
            .iter_mut()
            .min_by_key(|s| s.max_micros);

        if let Some(fastest) = fastest {
            if sql.max_micros > fastest.max_micros {
                *fastest = sql;
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&SlowSql> {
        self.slow_sqls.iter().find(|s| s.id == id)
    }

    pub fn num_saved(&self) -> u64 {
        self.slow_sqls.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slow_sqls.is_empty()
    }
}

impl PayloadCreator for SlowSqls {
    fn is_empty(&self) -> bool {
        SlowSqls::is_empty(self)
    }

    /// `[[[txn_name, txn_url, id, query, metric_name, count, total_ms, min_ms, max_ms, params], ...]]`
    fn data(&self, _run_id: &AgentRunId, _harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>> {
        let rows: Vec<_> = self
            .slow_sqls
            .iter()
            .map(|s| {
                json!([
                    s.txn_name,
                    s.txn_url,
                    s.id,
                    s.query,
                    s.metric_name,
                    s.count,
                    micros_to_millis(s.total_micros),
                    micros_to_millis(s.min_micros),
                    micros_to_millis(s.max_micros),
                    s.params,
                ])
            })
            .collect();

        Ok(serde_json::to_vec(&json!([rows]))?)
    }

    fn failed_harvest(self: Box<Self>, _harvest: &mut Harvest) {
        debug!("dropping {} slow sqls after failed harvest", self.num_saved());
    }

    fn cmd(&self) -> &'static str {
        collector::COMMAND_SLOW_SQLS
    }
}
