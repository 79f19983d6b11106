use std::collections::HashMap;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{trace, warn};

use crate::{
    actors::{processor::ProcessorConfig, trigger::FastHarvestAllowlist},
    app::Utilization,
    limits, util,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid app timeout {0}s: must not be negative")]
    NegativeAppTimeout(i64),
    #[error("invalid app timeout {0}s: out of range")]
    AppTimeoutOutOfRange(i64),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Port, absolute socket path or `@name` for an abstract socket
    #[serde(default = "crate::util::get_default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "crate::util::get_default_collector_host")]
    pub collector_host: String,

    /// Seconds without activity after which an app is forgotten
    #[serde(default = "default_app_timeout")]
    pub app_timeout: i64,

    /// Minimum number of open files to make available, 0 leaves the limit alone
    #[serde(default)]
    pub max_files: u64,

    #[serde(default)]
    pub foreground: bool,

    /// Serve `/debug/*` on this loopback port
    pub diagnostics_port: Option<u16>,

    /// License keys mapped to a faster event report period
    pub fast_harvest: Option<HashMap<String, i64>>,

    #[serde(default = "default_detect_utilization")]
    pub detect_utilization: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: util::get_default_bind_addr(),
            collector_host: util::get_default_collector_host(),
            app_timeout: default_app_timeout(),
            max_files: 0,
            foreground: false,
            diagnostics_port: None,
            fast_harvest: None,
            detect_utilization: default_detect_utilization(),
        }
    }
}

fn default_app_timeout() -> i64 {
    limits::DEFAULT_APP_TIMEOUT.as_secs() as i64
}

fn default_detect_utilization() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_timeout < 0 {
            return Err(ConfigError::NegativeAppTimeout(self.app_timeout));
        }
        if TimeDelta::try_seconds(self.app_timeout).is_none() {
            return Err(ConfigError::AppTimeoutOutOfRange(self.app_timeout));
        }
        Ok(())
    }

    /// Apply overrides from the environment.
    pub fn with_env(mut self) -> Self {
        if let Some(addr) = util::get_bind_addr() {
            trace!("bind address overridden by environment: {addr}");
            self.bind_addr = addr;
        }
        self
    }

    /// The fast harvest allow-list from the config file, falling back to the
    /// environment. An unparseable value is ignored.
    pub fn allowlist(&self) -> FastHarvestAllowlist {
        if let Some(entries) = &self.fast_harvest {
            return entries.clone().into_iter().collect();
        }

        match util::get_fast_harvest() {
            Some(raw) => FastHarvestAllowlist::parse(&raw).unwrap_or_else(|e| {
                warn!("ignoring malformed fast harvest allow-list: {e}");
                FastHarvestAllowlist::default()
            }),
            None => FastHarvestAllowlist::default(),
        }
    }

    pub fn processor_config(&self, allowlist: FastHarvestAllowlist) -> ProcessorConfig {
        ProcessorConfig {
            collector_host: self.collector_host.clone(),
            app_timeout: TimeDelta::try_seconds(self.app_timeout.max(0))
                .unwrap_or_else(|| ProcessorConfig::default().app_timeout),
            allowlist,
            trigger_units: Duration::from_secs(1),
            utilization: self.detect_utilization.then(Utilization::gather),
            ..ProcessorConfig::default()
        }
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
