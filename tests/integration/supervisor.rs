//! Integration tests for the worker supervisor
//!
//! These tests verify that:
//! - A clean shutdown exits with status 0
//! - Configuration problems restart cannot fix exit with status 1
//! - Bind failures a restart may fix exit with status 3

use std::time::Duration;

use harvestd::{
    config::Config,
    worker::{WorkerExit, run_worker_until},
};

use crate::helpers::RecordingCollector;

fn config(bind_addr: impl Into<String>) -> Config {
    Config {
        bind_addr: bind_addr.into(),
        detect_utilization: false,
        ..Config::default()
    }
}

async fn run(config: Config, shutdown_after: Duration) -> WorkerExit {
    let collector = RecordingCollector::with_run_id("run-1");
    let shutdown = tokio::time::sleep(shutdown_after);

    tokio::time::timeout(
        Duration::from_secs(10),
        run_worker_until(&config, collector, shutdown),
    )
    .await
    .expect("worker did not exit")
}

#[tokio::test]
async fn test_shutdown_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvestd.sock");

    let exit = run(config(path.to_str().unwrap()), Duration::from_millis(100)).await;
    assert_eq!(exit, WorkerExit::Clean);
    assert_eq!(exit.code(), 0);
}

#[tokio::test]
async fn test_invalid_bind_addr_is_fatal() {
    for addr in ["0", "70000", "relative/path.sock"] {
        let exit = run(config(addr), Duration::from_secs(5)).await;
        assert_eq!(exit, WorkerExit::Failure, "{addr}");
        assert_eq!(exit.code(), 1);
    }
}

#[tokio::test]
async fn test_unremovable_stale_socket_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvestd.sock");
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("occupied"), b"").unwrap();

    let exit = run(config(path.to_str().unwrap()), Duration::from_secs(5)).await;
    assert_eq!(exit, WorkerExit::Failure);
}

#[tokio::test]
async fn test_port_in_use_is_respawnable() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let exit = run(config(port.to_string()), Duration::from_secs(5)).await;
    assert_eq!(exit, WorkerExit::Respawn);
    assert_eq!(exit.code(), 3);
}

#[tokio::test]
async fn test_socket_is_served_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvestd.sock");
    let config = config(path.to_str().unwrap());

    let collector = RecordingCollector::with_run_id("run-1");
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        run_worker_until(&config, collector, async {
            let _ = stop_rx.await;
        })
        .await
    });

    let mut connected = None;
    for _ in 0..100 {
        if let Ok(stream) = tokio::net::UnixStream::connect(&path).await {
            connected = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connected.is_some(), "listener never came up");

    stop_tx.send(()).unwrap();
    let exit = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("worker did not exit")
        .unwrap();
    assert_eq!(exit, WorkerExit::Clean);
}
