//! Priority-weighted event reservoirs
//!
//! Each reservoir keeps at most `max_events` events. Every observation gets a
//! random sampling key derived from its priority (`ln(u) / priority`, with `u`
//! uniform in `(0, 1]`); the reservoir retains the events with the largest
//! keys. High priority events are therefore much more likely to survive an
//! overflow, but low priority ones are still represented.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use super::{PayloadCreator, PayloadResult, write_raw_array};
use crate::{AgentRunId, AnalyticsEvent, collector, harvest::Harvest, limits};

/// Weight used for events whose priority is zero, negative or NaN.
const MIN_WEIGHT: f64 = 1e-12;

/// The four event categories sharing the reservoir implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Txn,
    Custom,
    Error,
    Span,
}

impl EventKind {
    pub fn cmd(self) -> &'static str {
        match self {
            EventKind::Txn => collector::COMMAND_TXN_EVENTS,
            EventKind::Custom => collector::COMMAND_CUSTOM_EVENTS,
            EventKind::Error => collector::COMMAND_ERROR_EVENTS,
            EventKind::Span => collector::COMMAND_SPAN_EVENTS,
        }
    }

    pub fn max_events(self) -> usize {
        match self {
            EventKind::Txn => limits::MAX_TXN_EVENTS,
            EventKind::Custom => limits::MAX_CUSTOM_EVENTS,
            EventKind::Error => limits::MAX_ERROR_EVENTS,
            EventKind::Span => limits::MAX_SPAN_EVENTS,
        }
    }
}

#[derive(Debug)]
struct Sampled {
    key: f64,
    event: AnalyticsEvent,
}

impl PartialEq for Sampled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Sampled {}

impl PartialOrd for Sampled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sampled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key)
    }
}

fn sampling_key(priority: f64) -> f64 {
    let weight = if priority > 0.0 { priority } else { MIN_WEIGHT };
    // gen() is in [0, 1); flip it so ln() never sees zero
    let u: f64 = 1.0 - rand::thread_rng().r#gen::<f64>();
    u.ln() / weight
}

/// Fixed-capacity reservoir for one event category.
#[derive(Debug)]
pub struct EventReservoir {
    kind: EventKind,
    max_events: usize,
    num_seen: u64,
    failed_harvests: u32,
    // min-heap on the sampling key: the root is the next eviction candidate
    events: BinaryHeap<Reverse<Sampled>>,
}

impl EventReservoir {
    pub fn new(kind: EventKind, max_events: usize) -> Self {
        Self {
            kind,
            max_events,
            num_seen: 0,
            failed_harvests: 0,
            events: BinaryHeap::new(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn add_event(&mut self, event: AnalyticsEvent) {
        self.num_seen += 1;
        let key = sampling_key(event.priority.0);
        self.insert(Sampled { key, event });
    }

    fn insert(&mut self, sampled: Sampled) {
        if self.max_events == 0 {
            return;
        }

        if self.events.len() < self.max_events {
            self.events.push(Reverse(sampled));
            return;
        }

        if let Some(Reverse(lowest)) = self.events.peek() {
            if sampled.key > lowest.key {
                self.events.pop();
                self.events.push(Reverse(sampled));
            }
        }
    }

    /// Observations since the reservoir was created, kept or not.
    pub fn num_seen(&self) -> u64 {
        self.num_seen
    }

    /// Events currently buffered.
    pub fn num_saved(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Fold `other` into this reservoir. Events keep the sampling keys they
    /// were drawn with, so a merged reservoir samples as if every event had
    /// been observed here.
    pub fn merge(&mut self, other: EventReservoir) {
        self.num_seen += other.num_seen;
        if other.failed_harvests > self.failed_harvests {
            self.failed_harvests = other.failed_harvests;
        }
        for Reverse(sampled) in other.events {
            self.insert(sampled);
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &AnalyticsEvent> {
        self.events.iter().map(|Reverse(s)| &s.event)
    }
}

impl PayloadCreator for EventReservoir {
    fn is_empty(&self) -> bool {
        EventReservoir::is_empty(self)
    }

    /// `[run_id, {"reservoir_size": max, "events_seen": seen}, [event, ...]]`
    fn data(&self, run_id: &AgentRunId, _harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.events.len() * 64 + 64);
        buf.push(b'[');
        serde_json::to_writer(&mut buf, run_id)?;
        buf.push(b',');
        serde_json::to_writer(
            &mut buf,
            &json!({
                "reservoir_size": self.max_events,
                "events_seen": self.num_seen,
            }),
        )?;
        buf.push(b',');
        write_raw_array(&mut buf, self.events().map(|e| e.data.as_slice()));
        buf.push(b']');
        Ok(buf)
    }

    fn failed_harvest(self: Box<Self>, harvest: &mut Harvest) {
        let mut reservoir = *self;
        reservoir.failed_harvests += 1;

        if reservoir.failed_harvests >= limits::FAILED_EVENTS_ATTEMPTS_LIMIT {
            warn!(
                "discarding {} {} events after {} failed harvests",
                reservoir.num_saved(),
                reservoir.kind.cmd(),
                reservoir.failed_harvests
            );
            return;
        }

        debug!(
            "merging {} {} events into next harvest",
            reservoir.num_saved(),
            reservoir.kind.cmd()
        );
        harvest.reservoir_mut(reservoir.kind).merge(reservoir);
    }

    fn cmd(&self) -> &'static str {
        self.kind.cmd()
    }
}
