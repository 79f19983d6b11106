//! Bounded aggregation containers for one harvest window
//!
//! Every container here has a fixed maximum occupancy and a documented
//! overflow policy. None of them grows without bound, no matter how much data
//! the agents send.
//!
//! ## Containers
//!
//! - **MetricTable**: keyed by `(name, scope)`, drops new unforced names when full
//! - **EventReservoir**: priority-weighted random reservoir (txn, custom, error, span)
//! - **ErrorHeap**: keeps the highest priority errors
//! - **SlowSqls**: keeps the slowest distinct queries
//! - **TxnTraces**: keeps the slowest regular trace plus forced/synthetics traces
//!
//! ## Payloads
//!
//! Each container implements [`PayloadCreator`]. When a harvest flushes, the
//! container is detached from the harvest, encoded and handed to the outbound
//! sender. If the send fails transiently the container comes back through
//! [`PayloadCreator::failed_harvest`] and merges into the next window.

pub mod error;
pub mod error_heap;
pub mod events;
pub mod metrics;
pub mod slow_sql;
pub mod traces;

use chrono::{DateTime, Utc};

pub use error::{PayloadError, PayloadResult};
pub use error_heap::{ErrorHeap, TracedError};
pub use events::{EventKind, EventReservoir};
pub use metrics::{MetricData, MetricForce, MetricTable};
pub use slow_sql::{SlowSql, SlowSqls};
pub use traces::{TxnTrace, TxnTraces};

use crate::{AgentRunId, harvest::Harvest};

/// A container that can be turned into one outbound collector command.
pub trait PayloadCreator: Send {
    /// True if there is nothing worth sending.
    fn is_empty(&self) -> bool;

    /// Encode the payload for the collector.
    fn data(&self, run_id: &AgentRunId, harvest_start: DateTime<Utc>) -> PayloadResult<Vec<u8>>;

    /// Encode the audit representation.
    ///
    /// Most containers have no separate audit form and return `Ok(None)`, in
    /// which case integration output falls back to [`PayloadCreator::data`].
    fn audit(
        &self,
        _run_id: &AgentRunId,
        _harvest_start: DateTime<Utc>,
    ) -> PayloadResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Merge this payload back into `harvest` after a failed send.
    fn failed_harvest(self: Box<Self>, harvest: &mut Harvest);

    /// Collector command used to route the payload.
    fn cmd(&self) -> &'static str;
}

/// Payload as it should appear in integration/audit output.
pub(crate) fn integration_data(
    payload: &dyn PayloadCreator,
    run_id: &AgentRunId,
    harvest_start: DateTime<Utc>,
) -> PayloadResult<Vec<u8>> {
    match payload.audit(run_id, harvest_start)? {
        Some(audit) => Ok(audit),
        None => payload.data(run_id, harvest_start),
    }
}

/// Append `items` as a JSON array of already-encoded values.
pub(crate) fn write_raw_array<'a>(buf: &mut Vec<u8>, items: impl Iterator<Item = &'a [u8]>) {
    buf.push(b'[');
    for (i, item) in items.enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.extend_from_slice(item);
    }
    buf.push(b']');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integration_data_falls_back_to_data() {
        let mut errors = ErrorHeap::new(5);
        errors.add_error(TracedError::new(1, br#"{"e":1}"#.to_vec()));

        let run_id = AgentRunId::from("12345");
        let now = Utc::now();

        let integration = integration_data(&errors, &run_id, now).unwrap();
        assert_eq!(integration, errors.data(&run_id, now).unwrap());
    }

    #[test]
    fn test_write_raw_array() {
        let mut buf = Vec::new();
        let items: Vec<&[u8]> = vec![b"1", b"{}", b"\"x\""];
        write_raw_array(&mut buf, items.into_iter());
        assert_eq!(buf, br#"[1,{},"x"]"#);

        let mut empty = Vec::new();
        write_raw_array(&mut empty, std::iter::empty());
        assert_eq!(empty, b"[]");
    }
}
