//! Bounded heap of traced errors
//!
//! Keeps the highest-priority errors of a harvest window. Ties go to the
//! error that arrived first.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{PayloadCreator, PayloadResult, write_raw_array};
use crate::{AgentRunId, collector, harvest::Harvest};

/// One traced error as reported by an agent.
#[derive(Debug, Clone)]
pub struct TracedError {
    pub priority: i64,
    pub data: Vec<u8>,
    seq: u64,
}

impl TracedError {
    pub fn new(priority: i64, data: Vec<u8>) -> Self {
        Self {
            priority,
            data,
            seq: 0,
        }
    }
}

impl PartialEq for TracedError {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TracedError {}

impl PartialOrd for TracedError {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TracedError {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Bounded collection keeping the highest priority errors.
#[derive(Debug)]
pub struct ErrorHeap {
    max_errors: usize,
    next_seq: u64,
    num_seen: u64,
    errors: BinaryHeap<Reverse<TracedError>>,
}

impl ErrorHeap {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            next_seq: 0,
            num_seen: 0,
            errors: BinaryHeap::new(),
        }
    }

    /// Add an error, evicting the lowest priority one if the heap is full.
    /// A newcomer that does not beat the current minimum is dropped.
    pub fn add_error(&mut self, mut error: TracedError) {
        self.num_seen += 1;
        if self.max_errors == 0 {
            return;
        }

        error.seq = self.next_seq;
        self.next_seq += 1;

        if self.errors.len() < self.max_errors {
            self.errors.push(Reverse(error));
            return;
        }

        if let Some(Reverse(lowest)) = self.errors.peek() {
            if error.priority > lowest.priority {
                self.errors.pop();
                self.errors.push(Reverse(error));
            }
        }
    }

    pub fn num_seen(&self) -> u64 {
        self.num_seen
    }

    pub fn num_saved(&self) -> u64 {
        self.errors.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors from highest to lowest priority.
    fn ordered(&self) -> Vec<&TracedError> {
        let mut errors: Vec<_> = self.errors.iter().map(|Reverse(e)| e).collect();
        errors.sort_by(|a, b| b.cmp(a));
        errors
    }
}

impl PayloadCreator for ErrorHeap {
    fn is_empty(&self) -> bool {
        ErrorHeap::is_empty(self)
    }

    fn data(&self, run_id: &AgentRunId, _harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.push(b'[');
        serde_json::to_writer(&mut buf, run_id)?;
        buf.push(b',');
        write_raw_array(&mut buf, self.ordered().into_iter().map(|e| e.data.as_slice()));
        buf.push(b']');
        Ok(buf)
    }

    fn failed_harvest(self: Box<Self>, _harvest: &mut Harvest) {
        debug!("dropping {} errors after failed harvest", self.num_saved());
    }

    fn cmd(&self) -> &'static str {
        collector::COMMAND_ERRORS
    }
}
