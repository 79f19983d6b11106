//! Processor - Owns every app and harvest
//!
//! The processor is the only task that touches aggregation containers. All
//! other components talk to it through [`ProcessorHandle`].
//!
//! ## Message Flow
//!
//! ```text
//! Listener ──AppInfo/TxnData──▶ Processor ──spawn──▶ connect / send tasks
//!                                 ▲   ▲                    │
//!      HarvestTrigger ──ticks─────┘   └──── outcomes ──────┘
//! ```
//!
//! Connects and sends run in their own tasks so a slow collector never blocks
//! aggregation. Their results come back as messages and are applied here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{Level, debug, enabled, error, info, instrument, trace, warn};

use crate::{
    AgentRunId,
    aggregation::{PayloadCreator, integration_data},
    app::{App, AppInfo, AppKey, AppState, Utilization, encode_payload, parse_connect_reply},
    client::{CollectorClient, CollectorError, CollectorTarget},
    harvest::{Harvest, TxnData},
    limits,
};

use super::messages::{
    AppInfoReply, HarvestTick, ProcessorCommand, ProcessorError, ProcessorStats,
};
use super::trigger::{FastHarvestAllowlist, HarvestTrigger, TriggerHandle, plan_for};

/// Settings for the processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Collector used when an app has no redirect collector.
    pub collector_host: String,
    pub app_timeout: TimeDelta,
    pub connect_backoff: TimeDelta,
    pub allowlist: FastHarvestAllowlist,
    /// Length of one report period "second".
    pub trigger_units: Duration,
    pub housekeeping_interval: Duration,
    pub utilization: Option<Utilization>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            collector_host: "localhost:8443".to_string(),
            app_timeout: TimeDelta::from_std(limits::DEFAULT_APP_TIMEOUT)
                .unwrap_or(TimeDelta::seconds(600)),
            connect_backoff: TimeDelta::from_std(limits::APP_CONNECT_ATTEMPT_BACKOFF)
                .unwrap_or(TimeDelta::seconds(30)),
            allowlist: FastHarvestAllowlist::default(),
            trigger_units: Duration::from_secs(1),
            housekeeping_interval: limits::HOUSEKEEPING_INTERVAL,
            utilization: None,
        }
    }
}

struct AppEntry {
    app: App,
    harvest: Option<Harvest>,
    trigger: Option<TriggerHandle>,
    connect_in_flight: bool,
}

struct ConnectOutcome {
    key: AppKey,
    result: Result<Vec<u8>, CollectorError>,
}

struct SendOutcome {
    run_id: AgentRunId,
    payload: Box<dyn PayloadCreator>,
    result: Result<(), CollectorError>,
}

#[derive(Default)]
struct Counters {
    txn_data_received: u64,
    harvests_sent: u64,
    harvests_failed: u64,
    connect_attempts: u64,
}

pub struct Processor {
    config: ProcessorConfig,
    client: Arc<dyn CollectorClient>,

    apps: HashMap<AppKey, AppEntry>,
    run_ids: HashMap<AgentRunId, AppKey>,

    command_rx: mpsc::Receiver<ProcessorCommand>,

    harvest_tx: mpsc::Sender<HarvestTick>,
    harvest_rx: mpsc::Receiver<HarvestTick>,

    connect_tx: mpsc::Sender<ConnectOutcome>,
    connect_rx: mpsc::Receiver<ConnectOutcome>,

    send_tx: mpsc::Sender<SendOutcome>,
    send_rx: mpsc::Receiver<SendOutcome>,

    counters: Counters,
}

impl Processor {
    /// Create a processor and the handle used to reach it. The processor does
    /// nothing until [`Processor::run`] is polled.
    pub fn new(config: ProcessorConfig, client: Arc<dyn CollectorClient>) -> (Self, ProcessorHandle) {
        let (command_tx, command_rx) = mpsc::channel(limits::TXN_DATA_CHAN_BUFFERING);
        let (harvest_tx, harvest_rx) = mpsc::channel(limits::HARVEST_CHAN_BUFFERING);
        let (connect_tx, connect_rx) = mpsc::channel(limits::APP_LIMIT);
        let (send_tx, send_rx) = mpsc::channel(limits::HARVEST_CHAN_BUFFERING);

        let processor = Self {
            config,
            client,
            apps: HashMap::new(),
            run_ids: HashMap::new(),
            command_rx,
            harvest_tx,
            harvest_rx,
            connect_tx,
            connect_rx,
            send_tx,
            send_rx,
            counters: Counters::default(),
        };

        (processor, ProcessorHandle { sender: command_tx })
    }

    /// Run the processor's main loop
    ///
    /// Runs until a Shutdown command is received or every handle is dropped.
    /// Every trigger is cancelled before returning.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting processor");

        let mut housekeeping = interval(self.config.housekeeping_interval);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ProcessorCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(tick) = self.harvest_rx.recv() => {
                    self.handle_tick(tick);
                }

                Some(outcome) = self.connect_rx.recv() => {
                    self.handle_connect_outcome(outcome).await;
                }

                Some(outcome) = self.send_rx.recv() => {
                    self.handle_send_outcome(outcome).await;
                }

                _ = housekeeping.tick() => {
                    self.housekeeping().await;
                }
            }
        }

        self.shutdown().await;
        debug!("processor stopped");
    }

    async fn handle_command(&mut self, cmd: ProcessorCommand) {
        match cmd {
            ProcessorCommand::AppInfo { info, respond_to } => {
                let reply = self.handle_app_info(*info);
                let _ = respond_to.send(reply);
            }
            ProcessorCommand::TxnData { run_id, data } => {
                self.handle_txn_data(&run_id, *data);
            }
            ProcessorCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            // handled by the run loop
            ProcessorCommand::Shutdown => {}
        }
    }

    fn handle_app_info(&mut self, info: AppInfo) -> Result<AppInfoReply, ProcessorError> {
        let key = info.key();
        let now = Utc::now();

        if !self.apps.contains_key(&key) {
            if self.apps.len() >= limits::APP_LIMIT {
                warn!("application limit reached, rejecting {info}");
                return Err(ProcessorError::AppLimitExceeded(limits::APP_LIMIT));
            }
            info!("new application: {info}");
            self.apps.insert(
                key.clone(),
                AppEntry {
                    app: App::new(info, now),
                    harvest: None,
                    trigger: None,
                    connect_in_flight: false,
                },
            );
        }

        let Some(entry) = self.apps.get_mut(&key) else {
            return Err(ProcessorError::Stopped);
        };
        entry.app.last_activity = now;

        if !entry.connect_in_flight
            && entry.app.needs_connect_attempt(now, self.config.connect_backoff)
        {
            self.start_connect(&key);
        }

        let entry = &self.apps[&key];
        Ok(AppInfoReply {
            state: entry.app.state,
            connect_reply: entry.app.raw_connect_reply.clone(),
        })
    }

    fn handle_txn_data(&mut self, run_id: &AgentRunId, data: TxnData) {
        let Some(entry) = self
            .run_ids
            .get(run_id)
            .and_then(|key| self.apps.get_mut(key))
        else {
            debug!("txn data for unknown run id {run_id}");
            return;
        };

        self.counters.txn_data_received += 1;

        let AppEntry { app, harvest, .. } = entry;
        app.last_activity = Utc::now();
        if let Some(harvest) = harvest {
            harvest.aggregate(data, &app.rules);
        }
    }

    fn target_for(&self, info: &AppInfo) -> CollectorTarget {
        let host = if info.redirect_collector.is_empty() {
            self.config.collector_host.clone()
        } else {
            info.redirect_collector.clone()
        };
        CollectorTarget {
            host,
            license: info.license.clone(),
        }
    }

    fn start_connect(&mut self, key: &AppKey) {
        let Some(entry) = self.apps.get(key) else {
            return;
        };

        let payload = entry
            .app
            .info
            .connect_payload(std::process::id(), self.config.utilization.clone());
        let payload = match encode_payload(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode connect payload for {}: {e}", entry.app);
                return;
            }
        };
        let target = self.target_for(&entry.app.info);

        if let Some(entry) = self.apps.get_mut(key) {
            entry.app.last_connect_attempt = Some(Utc::now());
            entry.connect_in_flight = true;
        }
        self.counters.connect_attempts += 1;

        let client = Arc::clone(&self.client);
        let outcomes = self.connect_tx.clone();
        let key = key.clone();

        tokio::spawn(async move {
            trace!("connecting to {}", target.host);
            let result = client.connect(&target, payload).await;
            let _ = outcomes.send(ConnectOutcome { key, result }).await;
        });
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome { key, result } = outcome;

        let Some(entry) = self.apps.get_mut(&key) else {
            debug!("connect finished for evicted app");
            return;
        };
        entry.connect_in_flight = false;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                entry.app.state = match e {
                    CollectorError::LicenseInvalid => AppState::InvalidLicense,
                    CollectorError::ForceDisconnect => AppState::Disconnected,
                    CollectorError::SecurityPolicies => AppState::InvalidSecurityPolicies,
                    _ => AppState::Unknown,
                };
                warn!("connect failed for {}: {e}", entry.app);
                return;
            }
        };

        let reply = match parse_connect_reply(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("unusable connect reply for {}: {e}", entry.app);
                return;
            }
        };

        let now = Utc::now();
        let run_id = reply.agent_run_id.clone();
        let plan = plan_for(
            &entry.app.info.license,
            reply.data_methods.as_ref(),
            &self.config.allowlist,
            self.config.trigger_units,
        );

        entry.app.connected(reply, raw, now);
        entry.harvest = Some(Harvest::new(now));

        let trigger = HarvestTrigger::spawn(plan, run_id.clone(), self.harvest_tx.clone());
        if let Some(previous) = entry.trigger.replace(trigger) {
            previous.cancel().await;
        }

        info!("{} connected with run id {run_id}", entry.app);
        self.run_ids.insert(run_id, key);
    }

    fn handle_tick(&mut self, tick: HarvestTick) {
        let HarvestTick {
            run_id,
            harvest_type,
        } = tick;

        let Some(entry) = self
            .run_ids
            .get(&run_id)
            .and_then(|key| self.apps.get_mut(key))
        else {
            debug!("harvest tick for unknown run id {run_id}");
            return;
        };
        let Some(harvest) = entry.harvest.as_mut() else {
            return;
        };

        let now = Utc::now();
        let payloads = harvest.take_payloads(harvest_type, now);
        if payloads.is_empty() {
            trace!("nothing to harvest for {harvest_type}");
            return;
        }

        let info = entry.app.info.clone();
        let target = self.target_for(&info);
        debug!("harvesting {} payloads for {info} ({harvest_type})", payloads.len());

        for payload in payloads {
            let data = match payload.data(&run_id, now) {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to encode {}: {e}", payload.cmd());
                    continue;
                }
            };
            if enabled!(Level::TRACE) {
                match integration_data(&*payload, &run_id, now) {
                    Ok(audit) => {
                        trace!("{} payload: {}", payload.cmd(), String::from_utf8_lossy(&audit))
                    }
                    Err(e) => trace!("no audit output for {}: {e}", payload.cmd()),
                }
            }

            let client = Arc::clone(&self.client);
            let outcomes = self.send_tx.clone();
            let target = target.clone();
            let run_id = run_id.clone();

            tokio::spawn(async move {
                let result = client.send(&target, &run_id, payload.cmd(), data).await;
                let _ = outcomes
                    .send(SendOutcome {
                        run_id,
                        payload,
                        result,
                    })
                    .await;
            });
        }
    }

    async fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        let SendOutcome {
            run_id,
            payload,
            result,
        } = outcome;

        let err = match result {
            Ok(()) => {
                trace!("sent {}", payload.cmd());
                self.counters.harvests_sent += 1;
                return;
            }
            Err(e) => e,
        };
        self.counters.harvests_failed += 1;

        let Some(key) = self.run_ids.get(&run_id).cloned() else {
            debug!("dropping {} for stale run id {run_id}", payload.cmd());
            return;
        };

        match err {
            CollectorError::ForceRestart => {
                info!("collector requested restart for run id {run_id}");
                self.disconnect(&key, AppState::Unknown).await;
            }
            CollectorError::ForceDisconnect => {
                warn!("collector requested disconnect for run id {run_id}");
                self.disconnect(&key, AppState::Disconnected).await;
            }
            CollectorError::LicenseInvalid => {
                warn!("invalid license for run id {run_id}");
                self.disconnect(&key, AppState::InvalidLicense).await;
            }
            e => {
                warn!("failed to send {}: {e}", payload.cmd());
                if let Some(harvest) = self.apps.get_mut(&key).and_then(|e| e.harvest.as_mut()) {
                    payload.failed_harvest(harvest);
                }
            }
        }
    }

    /// Drop the connection of an app and move it to `state`.
    async fn disconnect(&mut self, key: &AppKey, state: AppState) {
        let Some(entry) = self.apps.get_mut(key) else {
            return;
        };

        if let Some(run_id) = entry.app.run_id() {
            self.run_ids.remove(run_id);
        }
        entry.app.reset();
        entry.app.state = state;
        entry.harvest = None;

        if let Some(trigger) = entry.trigger.take() {
            trigger.cancel().await;
        }
    }

    async fn housekeeping(&mut self) {
        let now = Utc::now();

        let expired: Vec<AppKey> = self
            .apps
            .iter()
            .filter(|(_, entry)| entry.app.inactive(now, self.config.app_timeout))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            let Some(entry) = self.apps.remove(&key) else {
                continue;
            };
            info!("removing inactive app {}", entry.app);
            if let Some(run_id) = entry.app.run_id() {
                self.run_ids.remove(run_id);
            }
            if let Some(trigger) = entry.trigger {
                trigger.cancel().await;
            }
        }

        let due: Vec<AppKey> = self
            .apps
            .iter()
            .filter(|(_, entry)| {
                !entry.connect_in_flight
                    && entry.app.needs_connect_attempt(now, self.config.connect_backoff)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            self.start_connect(&key);
        }
    }

    fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            apps: self.apps.len(),
            connected_apps: self
                .apps
                .values()
                .filter(|entry| entry.app.state == AppState::Connected)
                .count(),
            txn_data_received: self.counters.txn_data_received,
            harvests_sent: self.counters.harvests_sent,
            harvests_failed: self.counters.harvests_failed,
            connect_attempts: self.counters.connect_attempts,
        }
    }

    async fn shutdown(&mut self) {
        let count = self.apps.len();
        for (_, entry) in self.apps.drain() {
            if let Some(trigger) = entry.trigger {
                trigger.cancel().await;
            }
        }
        self.run_ids.clear();
        debug!("cancelled triggers of {count} apps");
    }
}

/// Handle for talking to a Processor
///
/// Cheap to clone. Every method fails with [`ProcessorError::Stopped`] once
/// the processor has exited.
#[derive(Clone, Debug)]
pub struct ProcessorHandle {
    sender: mpsc::Sender<ProcessorCommand>,
}

impl ProcessorHandle {
    /// Spawn a new processor and return its handle.
    pub fn spawn(config: ProcessorConfig, client: Arc<dyn CollectorClient>) -> Self {
        let (processor, handle) = Processor::new(config, client);
        tokio::spawn(processor.run());
        handle
    }

    pub async fn app_info(&self, info: AppInfo) -> Result<AppInfoReply, ProcessorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessorCommand::AppInfo {
                info: Box::new(info),
                respond_to: tx,
            })
            .await
            .map_err(|_| ProcessorError::Stopped)?;

        rx.await.map_err(|_| ProcessorError::Stopped)?
    }

    pub async fn txn_data(&self, run_id: AgentRunId, data: TxnData) -> Result<(), ProcessorError> {
        self.sender
            .send(ProcessorCommand::TxnData {
                run_id,
                data: Box::new(data),
            })
            .await
            .map_err(|_| ProcessorError::Stopped)
    }

    pub async fn get_stats(&self) -> Result<ProcessorStats, ProcessorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProcessorCommand::GetStats { respond_to: tx })
            .await
            .map_err(|_| ProcessorError::Stopped)?;

        rx.await.map_err(|_| ProcessorError::Stopped)
    }

    /// Ask the processor to cancel every trigger and stop.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        self.sender
            .send(ProcessorCommand::Shutdown)
            .await
            .map_err(|_| ProcessorError::Stopped)
    }

    /// True once the processor has exited.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the processor has exited.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}
