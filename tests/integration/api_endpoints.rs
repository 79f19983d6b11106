//! Integration tests for the diagnostics endpoint
//!
//! These tests verify that:
//! - The server binds on loopback and answers health checks
//! - `/debug/vars` reflects the processor's counters

use std::net::SocketAddr;

use harvestd::{
    actors::processor::ProcessorHandle,
    api::{ApiConfig, ApiState, spawn_api_server},
    app::AppInfo,
};
use serde_json::Value;

use crate::helpers::{RecordingCollector, app_info, fast_processor_config};

async fn spawn_test_api() -> (SocketAddr, ProcessorHandle) {
    let collector = RecordingCollector::with_run_id("run-1");
    let processor = ProcessorHandle::spawn(fast_processor_config(), collector);

    let addr = spawn_api_server(ApiConfig::loopback(0), ApiState::new(processor.clone()))
        .await
        .unwrap();
    (addr, processor)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _processor) = spawn_test_api().await;
    assert!(addr.ip().is_loopback());

    let response = reqwest::get(format!("http://{addr}/debug/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_vars_endpoint_reports_apps() {
    let (addr, processor) = spawn_test_api().await;

    let info: AppInfo = serde_json::from_value(app_info("license", "My App")).unwrap();
    processor.app_info(info).await.unwrap();

    let url = url::Url::parse(&format!("http://{addr}/debug/vars")).unwrap();
    let body: Value = reqwest::get(url).await.unwrap().json().await.unwrap();

    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["stats"]["apps"], 1);
    assert!(body["pid"].as_u64().is_some());
}

#[tokio::test]
async fn test_unknown_route() {
    let (addr, _processor) = spawn_test_api().await;

    let response = reqwest::get(format!("http://{addr}/debug/nothing"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
