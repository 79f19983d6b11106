//! Integration tests for harvest trigger groups sharing one tick channel
//!
//! These tests verify that:
//! - Cancelling one app's trigger leaves the others running
//! - Plans negotiated from a connect reply drive the expected categories
//! - Dropping a handle stops its cadences

use std::collections::HashSet;
use std::time::Duration;

use harvestd::{
    AgentRunId,
    actors::{
        messages::{HarvestTick, HarvestType},
        trigger::{FastHarvestAllowlist, HarvestTrigger, TriggerPlan, plan_for},
    },
    collector::{DataMethods, ReportPeriod},
};
use tokio::sync::mpsc;

const UNIT: Duration = Duration::from_millis(1);

fn drain(rx: &mut mpsc::Receiver<HarvestTick>) -> Vec<HarvestTick> {
    let mut ticks = Vec::new();
    while let Ok(tick) = rx.try_recv() {
        ticks.push(tick);
    }
    ticks
}

#[tokio::test]
async fn test_cancel_one_of_many() {
    let (tx, mut rx) = mpsc::channel(256);

    let first = HarvestTrigger::spawn(
        TriggerPlan::Uniform(UNIT * 2),
        AgentRunId::from("first"),
        tx.clone(),
    );
    let second = HarvestTrigger::spawn(
        TriggerPlan::Uniform(UNIT * 2),
        AgentRunId::from("second"),
        tx,
    );

    tokio::time::sleep(UNIT * 20).await;
    first.cancel().await;
    drain(&mut rx);

    tokio::time::sleep(UNIT * 20).await;
    let ticks = drain(&mut rx);
    assert!(!ticks.is_empty());
    assert!(ticks.iter().all(|tick| tick.run_id.as_str() == "second"));

    second.cancel().await;
    drain(&mut rx);
    tokio::time::sleep(UNIT * 20).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_negotiated_plan_drives_every_category() {
    let methods = DataMethods {
        analytic_event_data: Some(ReportPeriod::seconds(5)),
        custom_event_data: Some(ReportPeriod::seconds(10)),
        error_event_data: Some(ReportPeriod::seconds(15)),
        span_event_data: Some(ReportPeriod::seconds(20)),
    };
    let plan = plan_for("license", Some(&methods), &FastHarvestAllowlist::default(), UNIT);
    assert_eq!(plan.cadences().len(), 5);

    let (tx, mut rx) = mpsc::channel(256);
    let handle = HarvestTrigger::spawn(plan, AgentRunId::from("run"), tx);

    let mut seen = HashSet::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.len() < 5 {
            seen.insert(rx.recv().await.unwrap().harvest_type);
        }
    })
    .await
    .expect("not every category ticked");

    assert!(!seen.contains(&HarvestType::All));
    handle.cancel().await;
}

#[tokio::test]
async fn test_dropped_handle_stops_cadences() {
    let (tx, mut rx) = mpsc::channel(256);
    let handle = HarvestTrigger::spawn(
        TriggerPlan::Uniform(UNIT),
        AgentRunId::from("run"),
        tx,
    );

    let _ = rx.recv().await;
    drop(handle);

    // Every sender is owned by a cadence, so the channel closes once they
    // have all stopped.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
