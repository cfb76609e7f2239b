//! Canonical metric keys for job reports and telemetry.
//!
//! Use these constants/helpers everywhere to avoid stringly-typed drift.

/// Messages received from the broker, before any filtering.
pub const MESSAGES_RECEIVED: &str = "messages_received";
/// Messages accepted by a source filter and handed to a writer.
pub const MESSAGES_PROCESSED: &str = "messages_processed";
/// Messages dropped for unknown schema tags or failed verification.
pub const FLATBUFFER_ERRORS: &str = "flatbuffer_errors";
/// Broker-level errors observed while polling.
pub const KAFKA_ERRORS: &str = "kafka_errors";
/// Poll timeouts observed.
pub const KAFKA_TIMEOUTS: &str = "kafka_timeouts";
/// Appends completed by the writer loop.
pub const WRITES_DONE: &str = "writes_done";
/// Appends that failed inside a writer module.
pub const WRITE_ERRORS: &str = "write_errors";

/// Per-partition counter prefix.
pub const PARTITION_PREFIX: &str = "partition.";

/// Build a per-partition counter key, e.g. `partition.sample_env:0.kafka_errors`.
pub fn partition_key(topic: &str, partition: i32, counter: &str) -> String {
    format!("{}{}:{}.{}", PARTITION_PREFIX, topic, partition, counter)
}

/// Parse a per-partition key back into `(topic:partition, counter)`.
pub fn parse_partition_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(PARTITION_PREFIX)?.rsplit_once('.')
}
