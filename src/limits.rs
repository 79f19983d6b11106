//! Capacity limits and timing constants shared across the daemon.

use std::time::Duration;

/// Maximum number of applications the daemon will track at once.
pub const APP_LIMIT: usize = 250;

/// Minimum time between two connect attempts for the same application.
pub const APP_CONNECT_ATTEMPT_BACKOFF: Duration = Duration::from_secs(30);

/// Elapsed time after which an application without activity is evicted.
pub const DEFAULT_APP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// Harvest data limits

pub const MAX_METRICS: usize = 2 * 1000;
pub const MAX_TXN_EVENTS: usize = 10 * 1000;
pub const MAX_CUSTOM_EVENTS: usize = 10 * 1000;
pub const MAX_ERROR_EVENTS: usize = 100;
pub const MAX_SPAN_EVENTS: usize = 1000;
pub const MAX_ERRORS: usize = 20;
pub const MAX_SLOW_SQLS: usize = 10;
pub const MAX_FORCE_PERSIST_TRACES: usize = 10;
pub const MAX_SYNTHETICS_TRACES: usize = 20;

// Failed harvest rollover limits. Custom and txn events share the event limit.

pub const FAILED_EVENTS_ATTEMPTS_LIMIT: u32 = 10;
pub const FAILED_METRIC_ATTEMPTS_LIMIT: u32 = 5;

/// Time limit for a single request to the collector, connection included.
/// Kept below the default report period so a timed out payload can still be
/// merged into the next harvest.
pub const HARVEST_TIMEOUT: Duration = Duration::from_secs(45);

// Channel buffering

pub const TXN_DATA_CHAN_BUFFERING: usize = 10_000;
pub const HARVEST_CHAN_BUFFERING: usize = 64;

/// Maximum number of bytes sent for the host and display host names.
pub const HOST_LENGTH_BYTE_LIMIT: usize = 255;

/// Interval at which the processor evicts idle apps and retries connects.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);
