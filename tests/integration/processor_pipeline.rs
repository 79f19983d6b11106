//! Integration tests for the agent -> listener -> processor -> collector path
//!
//! These tests verify that:
//! - Apps connect through the listener and receive the connect reply
//! - Transaction data is aggregated and harvested into collector payloads
//! - Per-category report periods flush events ahead of default data
//! - Malformed requests do not break a connection

use std::path::PathBuf;
use std::time::Duration;

use harvestd::{
    actors::{
        listener::Listener,
        processor::{ProcessorConfig, ProcessorHandle},
        trigger::FastHarvestAllowlist,
    },
    worker::bind_addr::BindAddr,
};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::helpers::{AgentConnection, RecordingCollector, app_info, fast_processor_config};

struct Daemon {
    _dir: TempDir,
    path: PathBuf,
    processor: ProcessorHandle,
}

async fn start_daemon(config: ProcessorConfig, collector: std::sync::Arc<RecordingCollector>) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvestd.sock");

    let processor = ProcessorHandle::spawn(config, collector);
    let listener = Listener::bind(&BindAddr::Unix(path.clone())).await.unwrap();
    tokio::spawn(listener.run(processor.clone()));

    Daemon {
        _dir: dir,
        path,
        processor,
    }
}

fn txn_data(run_id: &str) -> Value {
    json!({
        "command": "txn_data",
        "run_id": run_id,
        "data": {
            "pid": 4321,
            "metrics": [
                {"name": "WebTransaction/Action/index", "data": [1.0, 0.5, 0.5, 0.5, 0.5, 0.25]}
            ],
            "txn_events": [
                {"priority": 0.5, "data": [{"type": "Transaction", "name": "index"}, {}, {}]}
            ],
            "errors": [
                {"priority": 1, "data": [0, "WebTransaction/Action/index", "boom", "Error", {}]}
            ]
        }
    })
}

fn metric_names(payload: &Value) -> Vec<String> {
    payload[3]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry[0]["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_app_connects_through_listener() {
    let collector = RecordingCollector::with_run_id("run-1");
    let daemon = start_daemon(fast_processor_config(), collector).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    let reply = agent.wait_connected(app_info("license", "My App")).await;

    assert_eq!(reply["connect_reply"]["agent_run_id"], "run-1");

    let stats = daemon.processor.get_stats().await.unwrap();
    assert_eq!(stats.apps, 1);
    assert_eq!(stats.connected_apps, 1);
}

#[tokio::test]
async fn test_txn_data_is_harvested() {
    let collector = RecordingCollector::with_run_id("run-1");
    let daemon = start_daemon(fast_processor_config(), collector.clone()).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.wait_connected(app_info("license", "My App")).await;
    agent.send(txn_data("run-1")).await;

    let metrics = collector
        .wait_for("metric_data", Duration::from_secs(5))
        .await
        .expect("no metrics harvested");
    assert_eq!(metrics.run_id, "run-1");
    assert_eq!(metrics.payload[0], "run-1");

    let names = metric_names(&metrics.payload);
    assert!(names.contains(&"WebTransaction/Action/index".to_string()));
    assert!(names.contains(&"Instance/Reporting".to_string()));
    assert!(names.contains(&"Supportability/AnalyticsEvents/TotalEventsSeen".to_string()));

    let events = collector
        .wait_for("analytic_event_data", Duration::from_secs(5))
        .await
        .expect("no events harvested");
    assert_eq!(events.payload[1]["events_seen"], 1);
    assert_eq!(events.payload[2][0][0]["name"], "index");

    let errors = collector
        .wait_for("error_data", Duration::from_secs(5))
        .await
        .expect("no errors harvested");
    assert_eq!(errors.payload[1][0][2], "boom");

    let stats = daemon.processor.get_stats().await.unwrap();
    assert_eq!(stats.txn_data_received, 1);
    assert!(stats.harvests_sent >= 3);
}

#[tokio::test]
async fn test_fast_event_period_flushes_events_first() {
    let collector = RecordingCollector::new(json!({
        "agent_run_id": "run-fast",
        "data_methods": {
            "analytic_event_data": {"report_period_in_seconds": 5}
        }
    }));
    let daemon = start_daemon(fast_processor_config(), collector.clone()).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.wait_connected(app_info("license", "Fast App")).await;
    agent.send(txn_data("run-fast")).await;

    // Events go out every 50ms, default data only every 600ms.
    collector
        .wait_for("analytic_event_data", Duration::from_secs(5))
        .await
        .expect("no events harvested");
    assert!(collector.sent_for("metric_data").is_empty());

    collector
        .wait_for("metric_data", Duration::from_secs(5))
        .await
        .expect("no metrics harvested");
}

#[tokio::test]
async fn test_allowlisted_license_ignores_server_periods() {
    let collector = RecordingCollector::with_run_id("run-allowed");
    let config = ProcessorConfig {
        allowlist: [("allowed".to_string(), 5)].into_iter().collect::<FastHarvestAllowlist>(),
        ..fast_processor_config()
    };
    let daemon = start_daemon(config, collector.clone()).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.wait_connected(app_info("allowed", "Allowed App")).await;
    agent.send(txn_data("run-allowed")).await;

    // Every category, default data included, is flushed at 5 units.
    let metrics = collector
        .wait_for("metric_data", Duration::from_millis(400))
        .await;
    assert!(metrics.is_some());
}

#[tokio::test]
async fn test_malformed_request_is_skipped() {
    let collector = RecordingCollector::with_run_id("run-1");
    let daemon = start_daemon(fast_processor_config(), collector).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.send_raw("this is not json").await;
    agent.send(json!({"command": "unknown"})).await;

    let reply = agent.app_info(app_info("license", "My App")).await;
    assert!(reply["state"].is_string());
}

#[tokio::test]
async fn test_unknown_run_id_is_dropped() {
    let collector = RecordingCollector::with_run_id("run-1");
    let daemon = start_daemon(fast_processor_config(), collector.clone()).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.wait_connected(app_info("license", "My App")).await;
    agent.send(txn_data("someone-else")).await;

    // Round trip to make sure the txn data has been processed.
    agent.app_info(app_info("license", "My App")).await;

    let stats = daemon.processor.get_stats().await.unwrap();
    assert_eq!(stats.txn_data_received, 0);
}

#[tokio::test]
async fn test_listener_stops_with_processor() {
    let collector = RecordingCollector::with_run_id("run-1");
    let daemon = start_daemon(fast_processor_config(), collector).await;

    let mut agent = AgentConnection::connect(&daemon.path).await;
    agent.wait_connected(app_info("license", "My App")).await;

    daemon.processor.shutdown().await.unwrap();
    daemon.processor.closed().await;

    // The socket file is removed once the listener has stopped.
    let mut removed = false;
    for _ in 0..100 {
        if !daemon.path.exists() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed);
}
