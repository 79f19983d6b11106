//! Collector-side vocabulary: command names and negotiated report periods.
//!
//! The collector declares, per data category, how often it wants that data
//! reported. Those declarations come over the wire as JSON and may be missing
//! or malformed, so every value is clamped before a trigger is built from it.

use serde::{Deserialize, Deserializer};

use crate::actors::messages::HarvestType;

pub const COMMAND_CONNECT: &str = "connect";
pub const COMMAND_METRICS: &str = "metric_data";
pub const COMMAND_ERRORS: &str = "error_data";
pub const COMMAND_SLOW_SQLS: &str = "sql_trace_data";
pub const COMMAND_TRACES: &str = "transaction_sample_data";
pub const COMMAND_TXN_EVENTS: &str = "analytic_event_data";
pub const COMMAND_CUSTOM_EVENTS: &str = "custom_event_data";
pub const COMMAND_ERROR_EVENTS: &str = "error_event_data";
pub const COMMAND_SPAN_EVENTS: &str = "span_event_data";

pub const MINIMUM_REPORT_PERIOD: u64 = 5;
pub const DEFAULT_REPORT_PERIOD: u64 = 60;
pub const MAXIMUM_REPORT_PERIOD: u64 = 300;

/// A single declared report period.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportPeriod {
    /// `None` when the field is absent or not a number.
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub report_period_in_seconds: Option<i64>,
}

impl ReportPeriod {
    pub fn seconds(seconds: i64) -> Self {
        Self {
            report_period_in_seconds: Some(seconds),
        }
    }
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs.trunc() as i64)))
}

/// Per-category report periods declared by the collector.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataMethods {
    #[serde(default)]
    pub error_event_data: Option<ReportPeriod>,
    #[serde(default)]
    pub analytic_event_data: Option<ReportPeriod>,
    #[serde(default)]
    pub custom_event_data: Option<ReportPeriod>,
    #[serde(default)]
    pub span_event_data: Option<ReportPeriod>,
}

impl DataMethods {
    /// Every event category reported at the same period.
    pub fn uniform(seconds: i64) -> Self {
        Self {
            error_event_data: Some(ReportPeriod::seconds(seconds)),
            analytic_event_data: Some(ReportPeriod::seconds(seconds)),
            custom_event_data: Some(ReportPeriod::seconds(seconds)),
            span_event_data: Some(ReportPeriod::seconds(seconds)),
        }
    }

    /// Raw declared value for an event category. Default data and `All` have
    /// no per-category declaration.
    pub fn raw_period(&self, category: HarvestType) -> Option<i64> {
        let period = match category {
            HarvestType::TxnEvents => self.analytic_event_data.as_ref(),
            HarvestType::CustomEvents => self.custom_event_data.as_ref(),
            HarvestType::ErrorEvents => self.error_event_data.as_ref(),
            HarvestType::SpanEvents => self.span_event_data.as_ref(),
            HarvestType::DefaultData | HarvestType::All => None,
        };

        period.and_then(|p| p.report_period_in_seconds)
    }

    /// Clamped report period for a category, in seconds.
    pub fn period_or_default(&self, category: HarvestType) -> u64 {
        clamp_report_period(self.raw_period(category))
    }

    /// True when every event category resolves to `period`.
    pub fn all_equal_to(&self, period: u64) -> bool {
        HarvestType::EVENT_TYPES
            .iter()
            .all(|category| self.period_or_default(*category) == period)
    }
}

/// Clamp a declared report period into `[MINIMUM, MAXIMUM]`.
///
/// Absent values and values below 1 fall back to the default, values in
/// `1..=5` become the minimum, and values above the maximum are capped.
pub fn clamp_report_period(value: Option<i64>) -> u64 {
    match value {
        None => DEFAULT_REPORT_PERIOD,
        Some(v) if v < 1 => DEFAULT_REPORT_PERIOD,
        Some(v) if v as u64 <= MINIMUM_REPORT_PERIOD => MINIMUM_REPORT_PERIOD,
        Some(v) if v as u64 <= MAXIMUM_REPORT_PERIOD => v as u64,
        Some(_) => MAXIMUM_REPORT_PERIOD,
    }
}
