//! HarvestTrigger - Drives the harvest cadences of one connected app
//!
//! A trigger is a group of cadence tasks, each emitting [`HarvestTick`]s for
//! one [`HarvestType`] on a shared channel. A coordinator task owns the
//! group's cancel channels.
//!
//! ## Cancellation
//!
//! ```text
//! TriggerHandle::cancel ──ack──▶ coordinator ──ack──▶ cadence 1
//!                                      │      ──ack──▶ cadence 2
//!                                      │       ...
//!        ◀──────── ack ────────────────┘  (after every member acked)
//! ```
//!
//! The coordinator forwards the request to each member in turn and waits for
//! its acknowledgment. Only when every member has stopped does it acknowledge
//! upward, so no tick is emitted once [`TriggerHandle::cancel`] returns.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, instrument, trace, warn};

use crate::{
    AgentRunId,
    collector::{self, DataMethods},
};

use super::messages::{HarvestTick, HarvestType};

type CancelRequest = oneshot::Sender<()>;

/// License keys that get a faster event harvest, mapped to the event report
/// period in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FastHarvestAllowlist(HashMap<String, i64>);

impl FastHarvestAllowlist {
    /// Parse a JSON object of `{"license": seconds}`.
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json).map(Self)
    }

    pub fn interval_for(&self, license: &str) -> Option<i64> {
        self.0.get(license).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, i64)> for FastHarvestAllowlist {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One periodic tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub harvest_type: HarvestType,
    pub period: Duration,
}

/// How an app's data is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPlan {
    /// A single cadence flushing everything.
    Uniform(Duration),
    /// Default data and each event category on their own cadence.
    PerCategory(Vec<Cadence>),
}

impl TriggerPlan {
    /// Everything at the default report period, in real seconds.
    pub fn default_uniform() -> Self {
        TriggerPlan::Uniform(Duration::from_secs(collector::DEFAULT_REPORT_PERIOD))
    }

    pub fn cadences(&self) -> Vec<Cadence> {
        match self {
            TriggerPlan::Uniform(period) => vec![Cadence {
                harvest_type: HarvestType::All,
                period: *period,
            }],
            TriggerPlan::PerCategory(cadences) => cadences.clone(),
        }
    }

    fn has_zero_period(&self) -> bool {
        self.cadences().iter().any(|c| c.period.is_zero())
    }
}

fn scaled(seconds: u64, units: Duration) -> Duration {
    u32::try_from(seconds)
        .ok()
        .and_then(|n| units.checked_mul(n))
        .unwrap_or(Duration::ZERO)
}

fn per_category(default_data: u64, events: impl Fn(HarvestType) -> u64, units: Duration) -> TriggerPlan {
    let mut cadences = vec![Cadence {
        harvest_type: HarvestType::DefaultData,
        period: scaled(default_data, units),
    }];
    cadences.extend(HarvestType::EVENT_TYPES.iter().map(|&harvest_type| Cadence {
        harvest_type,
        period: scaled(events(harvest_type), units),
    }));
    TriggerPlan::PerCategory(cadences)
}

/// Decide the cadences for an app.
///
/// An allow-listed license gets every category at its listed interval and
/// server configuration is ignored. Otherwise the collector's data methods are
/// used: when every event category resolves to the default period a single
/// uniform cadence is enough. `units` is the length of one "second" and only
/// differs from one second in tests.
pub fn plan_for(
    license: &str,
    data_methods: Option<&DataMethods>,
    allowlist: &FastHarvestAllowlist,
    units: Duration,
) -> TriggerPlan {
    let plan = if let Some(seconds) = allowlist.interval_for(license) {
        let period = collector::clamp_report_period(Some(seconds));
        debug!("license is allow-listed for {period}s harvests");
        per_category(period, |_| period, units)
    } else {
        match data_methods {
            Some(methods) if !methods.all_equal_to(collector::DEFAULT_REPORT_PERIOD) => {
                per_category(
                    collector::DEFAULT_REPORT_PERIOD,
                    |harvest_type| methods.period_or_default(harvest_type),
                    units,
                )
            }
            _ => TriggerPlan::Uniform(scaled(collector::DEFAULT_REPORT_PERIOD, units)),
        }
    };

    if plan.has_zero_period() {
        warn!("harvest plan has a zero-length period, using default uniform harvest");
        return TriggerPlan::default_uniform();
    }

    plan
}

/// Spawns the cadence tasks of a trigger.
pub struct HarvestTrigger;

impl HarvestTrigger {
    /// Start every cadence of `plan`, emitting ticks for `run_id` on `tx`.
    ///
    /// Zero-length periods are not accepted by the timer; plans built by
    /// [`plan_for`] never contain them.
    pub fn spawn(plan: TriggerPlan, run_id: AgentRunId, tx: mpsc::Sender<HarvestTick>) -> TriggerHandle {
        let members: Vec<_> = plan
            .cadences()
            .into_iter()
            .map(|cadence| {
                let (cancel_tx, cancel_rx) = mpsc::channel(1);
                tokio::spawn(run_cadence(cadence, run_id.clone(), tx.clone(), cancel_rx));
                cancel_tx
            })
            .collect();

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        tokio::spawn(coordinate(run_id.clone(), members, cancel_rx));

        TriggerHandle { cancel_tx, run_id }
    }
}

#[instrument(skip(tx, cancel_rx), fields(run_id = %run_id, harvest_type = %cadence.harvest_type))]
async fn run_cadence(
    cadence: Cadence,
    run_id: AgentRunId,
    tx: mpsc::Sender<HarvestTick>,
    mut cancel_rx: mpsc::Receiver<CancelRequest>,
) {
    trace!("starting cadence every {:?}", cadence.period);

    let mut ticker = interval_at(Instant::now() + cadence.period, cadence.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            request = cancel_rx.recv() => {
                acknowledge(request);
                return;
            }

            _ = ticker.tick() => {
                let tick = HarvestTick {
                    run_id: run_id.clone(),
                    harvest_type: cadence.harvest_type,
                };

                // A full channel must not delay cancellation.
                tokio::select! {
                    biased;

                    request = cancel_rx.recv() => {
                        acknowledge(request);
                        return;
                    }

                    sent = tx.send(tick) => {
                        if sent.is_err() {
                            debug!("tick receiver gone, stopping cadence");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn acknowledge(request: Option<CancelRequest>) {
    match request {
        Some(ack) => {
            trace!("cadence cancelled");
            let _ = ack.send(());
        }
        None => trace!("cancel channel closed"),
    }
}

#[instrument(skip(members, cancel_rx), fields(run_id = %run_id))]
async fn coordinate(
    run_id: AgentRunId,
    members: Vec<mpsc::Sender<CancelRequest>>,
    mut cancel_rx: mpsc::Receiver<CancelRequest>,
) {
    // A dropped handle cancels the group as well.
    let request = cancel_rx.recv().await;

    for member in members {
        let (ack_tx, ack_rx) = oneshot::channel();
        if member.send(ack_tx).await.is_err() {
            // already exited
            continue;
        }
        // An error here means the member exited without acknowledging.
        let _ = ack_rx.await;
    }

    debug!("all cadences stopped");
    if let Some(ack) = request {
        let _ = ack.send(());
    }
}

/// Handle for cancelling a running trigger.
#[derive(Debug)]
pub struct TriggerHandle {
    cancel_tx: mpsc::Sender<CancelRequest>,
    run_id: AgentRunId,
}

impl TriggerHandle {
    pub fn run_id(&self) -> &AgentRunId {
        &self.run_id
    }

    /// Stop every cadence. Returns once all of them have stopped.
    pub async fn cancel(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cancel_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::collector::ReportPeriod;

    const UNIT: Duration = Duration::from_millis(1);

    fn all_categories(period: Duration) -> TriggerPlan {
        let mut cadences = vec![Cadence {
            harvest_type: HarvestType::DefaultData,
            period,
        }];
        cadences.extend(
            HarvestType::EVENT_TYPES
                .iter()
                .map(|&harvest_type| Cadence { harvest_type, period }),
        );
        TriggerPlan::PerCategory(cadences)
    }

    fn period_of(plan: &TriggerPlan, harvest_type: HarvestType) -> Duration {
        plan.cadences()
            .into_iter()
            .find(|c| c.harvest_type == harvest_type)
            .map(|c| c.period)
            .unwrap()
    }

    #[test]
    fn test_plan_without_data_methods_is_uniform() {
        let plan = plan_for("license", None, &FastHarvestAllowlist::default(), UNIT);
        assert_eq!(plan, TriggerPlan::Uniform(UNIT * 60));
    }

    #[test]
    fn test_plan_with_default_periods_is_uniform() {
        let methods = DataMethods::uniform(60);
        let plan = plan_for("license", Some(&methods), &FastHarvestAllowlist::default(), UNIT);
        assert_eq!(plan, TriggerPlan::Uniform(UNIT * 60));

        // out of range values clamp back to the default
        let methods = DataMethods::uniform(-10);
        let plan = plan_for("license", Some(&methods), &FastHarvestAllowlist::default(), UNIT);
        assert_eq!(plan, TriggerPlan::Uniform(UNIT * 60));
    }

    #[test]
    fn test_plan_per_category() {
        let methods = DataMethods {
            analytic_event_data: Some(ReportPeriod::seconds(5)),
            custom_event_data: Some(ReportPeriod::seconds(1000)),
            error_event_data: None,
            span_event_data: Some(ReportPeriod::seconds(2)),
        };
        let plan = plan_for("license", Some(&methods), &FastHarvestAllowlist::default(), UNIT);

        assert_eq!(plan.cadences().len(), 5);
        assert_eq!(period_of(&plan, HarvestType::DefaultData), UNIT * 60);
        assert_eq!(period_of(&plan, HarvestType::TxnEvents), UNIT * 5);
        assert_eq!(period_of(&plan, HarvestType::CustomEvents), UNIT * 300);
        assert_eq!(period_of(&plan, HarvestType::ErrorEvents), UNIT * 60);
        assert_eq!(period_of(&plan, HarvestType::SpanEvents), UNIT * 5);
    }

    #[test]
    fn test_allowlist_overrides_server_configuration() {
        let allowlist: FastHarvestAllowlist =
            [("fast_license".to_string(), 10)].into_iter().collect();
        let methods = DataMethods::uniform(60);

        let plan = plan_for("fast_license", Some(&methods), &allowlist, UNIT);
        assert_eq!(plan, all_categories(UNIT * 10));

        // listed intervals are clamped too
        let allowlist: FastHarvestAllowlist =
            [("fast_license".to_string(), 1)].into_iter().collect();
        let plan = plan_for("fast_license", None, &allowlist, UNIT);
        assert_eq!(plan, all_categories(UNIT * 5));

        let plan = plan_for("other_license", Some(&methods), &allowlist, UNIT);
        assert_eq!(plan, TriggerPlan::Uniform(UNIT * 60));
    }

    #[test]
    fn test_allowlist_parse() {
        let allowlist = FastHarvestAllowlist::parse(r#"{"abc": 5, "def": 30}"#).unwrap();
        assert_eq!(allowlist.interval_for("abc"), Some(5));
        assert_eq!(allowlist.interval_for("xyz"), None);

        assert!(FastHarvestAllowlist::parse("not json").is_err());
    }

    #[test]
    fn test_zero_period_falls_back_to_default_uniform() {
        let methods = DataMethods::uniform(15);
        let plan = plan_for("license", Some(&methods), &FastHarvestAllowlist::default(), Duration::ZERO);
        assert_eq!(plan, TriggerPlan::default_uniform());
    }

    #[tokio::test]
    async fn test_every_category_is_observed() {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = HarvestTrigger::spawn(all_categories(UNIT), AgentRunId::from("run"), tx);

        let mut seen = HashSet::new();
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while seen.len() < 5 {
                let tick = rx.recv().await.unwrap();
                assert_eq!(tick.run_id.as_str(), "run");
                seen.insert(tick.harvest_type);
            }
        });
        deadline.await.unwrap();

        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_no_tick_after_cancel_ack() {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = HarvestTrigger::spawn(all_categories(UNIT), AgentRunId::from("run"), tx);

        // let it run for a while
        let _ = rx.recv().await;
        handle.cancel().await;

        // drain what was emitted before the ack
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(UNIT * 20).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_with_full_channel() {
        // capacity one and never drained: every cadence ends up blocked in send
        let (tx, _rx) = mpsc::channel(1);
        let handle = HarvestTrigger::spawn(all_categories(UNIT), AgentRunId::from("run"), tx);

        tokio::time::sleep(UNIT * 20).await;

        tokio::time::timeout(Duration::from_secs(5), handle.cancel())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let handle = HarvestTrigger::spawn(
            TriggerPlan::Uniform(UNIT),
            AgentRunId::from("run"),
            tx,
        );
        drop(rx);

        tokio::time::sleep(UNIT * 10).await;

        tokio::time::timeout(Duration::from_secs(5), handle.cancel())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_uniform_emits_all() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = HarvestTrigger::spawn(TriggerPlan::Uniform(UNIT), AgentRunId::from("run"), tx);

        let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.harvest_type, HarvestType::All);
        assert_eq!(handle.run_id().as_str(), "run");

        handle.cancel().await;
    }
}
