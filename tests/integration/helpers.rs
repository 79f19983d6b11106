//! Test helpers shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvestd::{
    AgentRunId,
    actors::processor::ProcessorConfig,
    client::{CollectorClient, CollectorError, CollectorTarget},
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

/// One payload received by [`RecordingCollector`].
#[derive(Debug, Clone)]
pub struct Sent {
    pub run_id: String,
    pub cmd: String,
    pub payload: Value,
}

/// Collector double that accepts every connect and records every send.
pub struct RecordingCollector {
    connect_reply: Value,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingCollector {
    pub fn new(connect_reply: Value) -> Arc<Self> {
        Arc::new(Self {
            connect_reply,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn with_run_id(run_id: &str) -> Arc<Self> {
        Self::new(json!({"agent_run_id": run_id}))
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_for(&self, cmd: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.cmd == cmd).collect()
    }

    /// Poll until a payload for `cmd` has been sent.
    pub async fn wait_for(&self, cmd: &str, timeout: Duration) -> Option<Sent> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(sent) = self.sent_for(cmd).into_iter().next() {
                return Some(sent);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

#[async_trait]
impl CollectorClient for RecordingCollector {
    async fn connect(
        &self,
        _target: &CollectorTarget,
        _payload: Vec<u8>,
    ) -> Result<Vec<u8>, CollectorError> {
        Ok(serde_json::to_vec(&self.connect_reply)?)
    }

    async fn send(
        &self,
        _target: &CollectorTarget,
        run_id: &AgentRunId,
        cmd: &str,
        payload: Vec<u8>,
    ) -> Result<(), CollectorError> {
        self.sent.lock().unwrap().push(Sent {
            run_id: run_id.to_string(),
            cmd: cmd.to_string(),
            payload: serde_json::from_slice(&payload)?,
        });
        Ok(())
    }
}

/// Processor settings where one report period second lasts 10ms.
pub fn fast_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        collector_host: "collector.test".to_string(),
        trigger_units: Duration::from_millis(10),
        housekeeping_interval: Duration::from_millis(20),
        ..ProcessorConfig::default()
    }
}

pub fn app_info(license: &str, app_name: &str) -> Value {
    json!({
        "license": license,
        "app_name": app_name,
        "language": "php",
        "version": "10.0.0",
        "settings": {"newrelic.enabled": true},
    })
}

/// Newline-delimited JSON connection to the listener.
pub struct AgentConnection {
    lines: Lines<BufReader<ReadHalf<UnixStream>>>,
    writer: WriteHalf<UnixStream>,
}

impl AgentConnection {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn send(&mut self, request: Value) {
        self.send_raw(&request.to_string()).await;
    }

    pub async fn reply(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("no reply")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    pub async fn app_info(&mut self, info: Value) -> Value {
        self.send(json!({"command": "app_info", "info": info})).await;
        self.reply().await
    }

    /// Repeat app info requests until the app is connected.
    pub async fn wait_connected(&mut self, info: Value) -> Value {
        for _ in 0..200 {
            let reply = self.app_info(info.clone()).await;
            if reply["state"] == "connected" {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("app never connected");
    }
}
