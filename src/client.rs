//! Outbound transport to the collector.
//!
//! Every request is a POST to `/agent_listener/invoke_raw_method` with the
//! command in the query string. The collector answers with either
//! `{"return_value": ...}` or `{"exception": {"error_type": ...}}`; the
//! exception types that change app state are mapped onto [`CollectorError`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, trace};

use crate::{AgentRunId, collector, limits};

pub const PROTOCOL_VERSION: &str = "17";

/// Where, and as whom, a request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorTarget {
    pub host: String,
    pub license: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid license")]
    LicenseInvalid,
    #[error("collector requested disconnect")]
    ForceDisconnect,
    #[error("collector requested restart")]
    ForceRestart,
    #[error("security policies mismatch")]
    SecurityPolicies,
    #[error("collector exception: {0}")]
    Exception(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid collector response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

impl CollectorError {
    fn from_exception(error_type: &str) -> Self {
        if error_type.contains("LicenseException") {
            CollectorError::LicenseInvalid
        } else if error_type.contains("ForceDisconnectException") {
            CollectorError::ForceDisconnect
        } else if error_type.contains("ForceRestartException") {
            CollectorError::ForceRestart
        } else if error_type.contains("SecurityPolicies") {
            CollectorError::SecurityPolicies
        } else {
            CollectorError::Exception(error_type.to_string())
        }
    }

    fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => CollectorError::LicenseInvalid,
            409 => CollectorError::ForceRestart,
            410 => CollectorError::ForceDisconnect,
            code => CollectorError::Status(code),
        }
    }
}

#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Send a connect payload. Returns the raw `return_value` of the reply.
    async fn connect(
        &self,
        target: &CollectorTarget,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CollectorError>;

    /// Send one harvest payload.
    async fn send(
        &self,
        target: &CollectorTarget,
        run_id: &AgentRunId,
        cmd: &str,
        payload: Vec<u8>,
    ) -> Result<(), CollectorError>;
}

#[derive(Debug, Deserialize)]
struct Exception {
    #[serde(default)]
    error_type: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    return_value: serde_json::Value,
    #[serde(default)]
    exception: Option<Exception>,
}

/// HTTP implementation of [`CollectorClient`].
#[derive(Debug, Clone)]
pub struct HttpCollectorClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpCollectorClient {
    pub fn new() -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(limits::HARVEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Send every request to `base_url` instead of `https://{host}`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn url(&self, target: &CollectorTarget) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/agent_listener/invoke_raw_method"),
            None => format!("https://{}/agent_listener/invoke_raw_method", target.host),
        }
    }

    #[instrument(skip(self, target, payload), fields(host = %target.host))]
    async fn invoke(
        &self,
        target: &CollectorTarget,
        method: &str,
        run_id: Option<&AgentRunId>,
        payload: Vec<u8>,
    ) -> Result<serde_json::Value, CollectorError> {
        let mut query = vec![
            ("method", method),
            ("protocol_version", PROTOCOL_VERSION),
            ("license_key", target.license.as_str()),
            ("marshal_format", "json"),
        ];
        if let Some(run_id) = run_id {
            query.push(("run_id", run_id.as_str()));
        }

        trace!("sending {} bytes", payload.len());

        let response = self
            .client
            .post(self.url(target))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        // Exceptions are more specific than the status code.
        if let Ok(Reply {
            exception: Some(exception),
            ..
        }) = serde_json::from_slice::<Reply>(&body)
        {
            debug!("collector exception: {}", exception.error_type);
            return Err(CollectorError::from_exception(&exception.error_type));
        }

        if !status.is_success() {
            return Err(CollectorError::from_status(status));
        }

        let reply: Reply = serde_json::from_slice(&body)?;
        Ok(reply.return_value)
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn connect(
        &self,
        target: &CollectorTarget,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, CollectorError> {
        let value = self
            .invoke(target, collector::COMMAND_CONNECT, None, payload)
            .await?;
        Ok(serde_json::to_vec(&value)?)
    }

    async fn send(
        &self,
        target: &CollectorTarget,
        run_id: &AgentRunId,
        cmd: &str,
        payload: Vec<u8>,
    ) -> Result<(), CollectorError> {
        self.invoke(target, cmd, Some(run_id), payload).await?;
        Ok(())
    }
}
