//! Applications, their identity and the connect workflow state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sysinfo::System;
use tracing::warn;

use crate::{AgentRunId, collector::DataMethods, limits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Unknown,
    Connected,
    InvalidLicense,
    Disconnected,
    InvalidSecurityPolicies,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Unknown => "unknown",
            AppState::Connected => "connected",
            AppState::InvalidLicense => "invalid_license",
            AppState::Disconnected => "disconnected",
            AppState::InvalidSecurityPolicies => "invalid_security_policies",
        };
        f.write_str(s)
    }
}

/// A security policy as declared by an agent or the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// Security policies an agent supports, keyed by policy name.
pub type SupportedPolicies = BTreeMap<String, SecurityPolicy>;

/// Deterministic digest of the supported policies, used as part of the
/// app identity.
fn policies_digest(policies: &SupportedPolicies) -> String {
    policies
        .iter()
        .map(|(name, policy)| format!("{name}:{}:{}", policy.enabled, policy.required))
        .collect::<Vec<_>>()
        .join(",")
}

/// Identity of an application. Two agents reporting the same key share one
/// app and one collector connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppKey {
    pub license: String,
    pub app_name: String,
    pub redirect_collector: String,
    pub high_security: bool,
    pub agent_language: String,
    pub agent_policies: String,
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

/// Description of an application as supplied by its agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppInfo {
    pub license: String,
    pub app_name: String,
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub display_host: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default = "empty_array")]
    pub environment: Value,
    #[serde(default)]
    pub high_security: bool,
    #[serde(default)]
    pub labels: Option<Value>,
    #[serde(default)]
    pub redirect_collector: String,
    #[serde(default)]
    pub security_policy_token: String,
    #[serde(default)]
    pub supported_policies: SupportedPolicies,
}

impl fmt::Display for AppInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.app_name)
    }
}

impl AppInfo {
    pub fn key(&self) -> AppKey {
        AppKey {
            license: self.license.clone(),
            app_name: self.app_name.clone(),
            redirect_collector: self.redirect_collector.clone(),
            high_security: self.high_security,
            agent_language: self.language.clone(),
            agent_policies: policies_digest(&self.supported_policies),
        }
    }

    /// Build the connect payload. The host sent is the utilization hostname
    /// so the two always agree.
    pub fn connect_payload(&self, pid: u32, util: Option<Utilization>) -> RawConnectPayload {
        let host = util
            .as_ref()
            .map(|u| u.hostname.clone())
            .unwrap_or_default();

        let labels = match &self.labels {
            Some(labels) if !labels.is_null() => labels.clone(),
            _ => empty_array(),
        };

        let security_policies = if self.security_policy_token.is_empty()
            || self.supported_policies.is_empty()
        {
            None
        } else {
            Some(self.supported_policies.clone())
        };

        RawConnectPayload {
            pid,
            language: self.language.clone(),
            agent_version: self.version.clone(),
            host,
            display_host: string_length_byte_limit(
                &self.display_host,
                limits::HOST_LENGTH_BYTE_LIMIT,
            )
            .to_string(),
            settings: self.settings.clone(),
            app_name: self.app_name.split(';').map(str::to_string).collect(),
            high_security: self.high_security,
            labels,
            environment: self.environment.clone(),
            // lets the collector tell "a;b" and "a;c" apart
            identifier: self.app_name.clone(),
            utilization: util,
            security_policies,
        }
    }
}

/// Host facts attached to the connect payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utilization {
    pub metadata_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_processors: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ram_mib: Option<u64>,
    pub hostname: String,
}

impl Utilization {
    pub fn gather() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let cpus = sys.cpus().len();
        let ram = sys.total_memory() / (1024 * 1024);

        Self {
            metadata_version: 1,
            logical_processors: (cpus > 0).then_some(cpus),
            total_ram_mib: (ram > 0).then_some(ram),
            hostname: System::host_name().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawConnectPayload {
    pub pid: u32,
    pub language: String,
    pub agent_version: String,
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_host: String,
    pub settings: Map<String, Value>,
    pub app_name: Vec<String>,
    pub high_security: bool,
    pub labels: Value,
    pub environment: Value,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<Utilization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_policies: Option<SupportedPolicies>,
}

/// Wrap a payload in the single-element array the collector expects.
pub fn encode_payload<T: Serialize>(payload: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&[payload])
}

/// Truncate `s` to at most `limit` bytes without splitting a character.
pub fn string_length_byte_limit(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Clone, Deserialize)]
struct MetricRuleConfig {
    match_expression: String,
    #[serde(default)]
    replacement: String,
    #[serde(default)]
    ignore: bool,
    #[serde(default)]
    eval_order: i64,
    #[serde(default)]
    terminate_chain: bool,
    #[serde(default)]
    replace_all: bool,
}

/// A compiled metric rename rule.
#[derive(Debug, Clone)]
pub struct MetricRule {
    regex: Regex,
    replacement: String,
    ignore: bool,
    eval_order: i64,
    terminate_chain: bool,
    replace_all: bool,
}

/// Convert `\1` style back references into the `${1}` form.
fn convert_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('\\', Some(d)) if d.is_ascii_digit() => {
                out.push_str(&format!("${{{d}}}"));
                chars.next();
            }
            ('$', _) => out.push_str("$$"),
            _ => out.push(c),
        }
    }
    out
}

impl TryFrom<MetricRuleConfig> for MetricRule {
    type Error = regex::Error;

    fn try_from(config: MetricRuleConfig) -> Result<Self, Self::Error> {
        let regex = Regex::new(&format!("(?i){}", config.match_expression))?;
        Ok(Self {
            regex,
            replacement: convert_replacement(&config.replacement),
            ignore: config.ignore,
            eval_order: config.eval_order,
            terminate_chain: config.terminate_chain,
            replace_all: config.replace_all,
        })
    }
}

/// Metric rename rules from the connect reply, ordered by `eval_order`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "Vec<MetricRuleConfig>")]
pub struct MetricRules(Vec<MetricRule>);

impl From<Vec<MetricRuleConfig>> for MetricRules {
    fn from(configs: Vec<MetricRuleConfig>) -> Self {
        let mut rules: Vec<MetricRule> = configs
            .into_iter()
            .filter_map(|config| {
                let expression = config.match_expression.clone();
                MetricRule::try_from(config)
                    .inspect_err(|e| warn!("skipping metric rule {expression:?}: {e}"))
                    .ok()
            })
            .collect();
        rules.sort_by_key(|rule| rule.eval_order);
        Self(rules)
    }
}

impl MetricRules {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply every rule in order. Returns `None` if the metric is ignored.
    pub fn apply(&self, name: &str) -> Option<String> {
        let mut name = name.to_string();

        for rule in &self.0 {
            if !rule.regex.is_match(&name) {
                continue;
            }
            if rule.ignore {
                return None;
            }

            name = if rule.replace_all {
                rule.regex.replace_all(&name, rule.replacement.as_str())
            } else {
                rule.regex.replace(&name, rule.replacement.as_str())
            }
            .into_owned();

            if rule.terminate_chain {
                break;
            }
        }

        Some(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConnectReply {
    #[serde(default)]
    agent_run_id: Option<AgentRunId>,
    #[serde(default)]
    metric_name_rules: MetricRules,
    #[serde(default)]
    data_methods: Option<DataMethods>,
    #[serde(default)]
    sampling_target_period_in_seconds: i64,
    #[serde(default)]
    sampling_target: i64,
}

/// The parts of a connect reply the daemon itself uses.
#[derive(Debug, Clone)]
pub struct ConnectReply {
    pub agent_run_id: AgentRunId,
    pub metric_name_rules: MetricRules,
    pub data_methods: Option<DataMethods>,
    pub sampling_target_period_in_seconds: i64,
    pub sampling_target: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectReplyError {
    #[error("malformed connect reply: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing agent run id")]
    MissingRunId,
}

pub fn parse_connect_reply(raw: &[u8]) -> Result<ConnectReply, ConnectReplyError> {
    let reply: RawConnectReply = serde_json::from_slice(raw)?;
    let agent_run_id = reply.agent_run_id.ok_or(ConnectReplyError::MissingRunId)?;

    Ok(ConnectReply {
        agent_run_id,
        metric_name_rules: reply.metric_name_rules,
        data_methods: reply.data_methods,
        sampling_target_period_in_seconds: reply.sampling_target_period_in_seconds,
        sampling_target: reply.sampling_target,
    })
}

/// State of one application.
#[derive(Debug)]
pub struct App {
    pub info: AppInfo,
    pub state: AppState,
    pub last_connect_attempt: Option<DateTime<Utc>>,
    pub connect_time: Option<DateTime<Utc>>,
    pub harvest_frequency: Option<TimeDelta>,
    pub sampling_target: u16,
    pub connect_reply: Option<ConnectReply>,
    pub raw_connect_reply: Option<Vec<u8>>,
    pub rules: MetricRules,
    pub last_activity: DateTime<Utc>,
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.info.fmt(f)
    }
}

impl App {
    pub fn new(info: AppInfo, now: DateTime<Utc>) -> Self {
        Self {
            info,
            state: AppState::Unknown,
            last_connect_attempt: None,
            connect_time: None,
            harvest_frequency: None,
            sampling_target: 0,
            connect_reply: None,
            raw_connect_reply: None,
            rules: MetricRules::default(),
            last_activity: now,
        }
    }

    pub fn key(&self) -> AppKey {
        self.info.key()
    }

    pub fn run_id(&self) -> Option<&AgentRunId> {
        self.connect_reply.as_ref().map(|r| &r.agent_run_id)
    }

    /// True when the app is `Unknown` and `backoff` has passed since the last
    /// attempt. An app that never attempted a connect always qualifies.
    pub fn needs_connect_attempt(&self, now: DateTime<Utc>, backoff: TimeDelta) -> bool {
        if self.state != AppState::Unknown {
            return false;
        }
        match self.last_connect_attempt {
            None => true,
            Some(last) => now - last >= backoff,
        }
    }

    /// True when more than `threshold` has elapsed since the last activity.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is negative.
    pub fn inactive(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        assert!(
            threshold >= TimeDelta::zero(),
            "invalid inactivity threshold: {threshold}"
        );
        now - self.last_activity > threshold
    }

    /// Record a successful connect.
    pub fn connected(&mut self, reply: ConnectReply, raw: Vec<u8>, now: DateTime<Utc>) {
        self.state = AppState::Connected;
        self.connect_time = Some(now);
        // out of range periods are treated as absent
        self.harvest_frequency = Some(reply.sampling_target_period_in_seconds)
            .filter(|&secs| secs > 0)
            .and_then(TimeDelta::try_seconds);
        self.sampling_target = u16::try_from(reply.sampling_target.max(0)).unwrap_or(u16::MAX);
        self.rules = reply.metric_name_rules.clone();
        self.connect_reply = Some(reply);
        self.raw_connect_reply = Some(raw);
    }

    /// Forget the current connection so the app reconnects.
    pub fn reset(&mut self) {
        self.state = AppState::Unknown;
        self.connect_time = None;
        self.connect_reply = None;
        self.raw_connect_reply = None;
        self.rules = MetricRules::default();
    }
}
