//! Compile-time defaults shared by the service and its tests.

use std::time::Duration;

/// Grace interval after the stop time during which late in-window messages
/// are still accepted.
pub const STOP_LEEWAY: Duration = Duration::from_secs(5);

/// Consecutive poll-timeout budget before a partition is marked errored.
pub const KAFKA_ERROR_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll timeout handed to the consumer.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between periodic job status reports.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Supervisor wake-up period while waiting for partitions to finish.
pub const SUPERVISOR_TICK: Duration = Duration::from_millis(50);

/// Default chunk size (rows) for numeric log datasets.
pub const CHUNK_SIZE: u64 = 128;

/// Default maximum length of one fixed-size string element.
pub const STRING_SIZE: u64 = 128;

/// Default chunk size (rows) for fixed-size string datasets.
pub const STRING_CHUNK_SIZE: u64 = 16;
