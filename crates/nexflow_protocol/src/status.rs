//! Status payloads: periodic per-job reports and the terminal result record.

use crate::types::{JobId, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Final job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Counter snapshot for one partition, keyed into reports by
/// `topic:partition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartitionCounters {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub flatbuffer_errors: u64,
    pub kafka_errors: u64,
    pub kafka_timeouts: u64,
}

impl PartitionCounters {
    pub fn accumulate(&mut self, other: &PartitionCounters) {
        self.messages_received += other.messages_received;
        self.messages_processed += other.messages_processed;
        self.flatbuffer_errors += other.flatbuffer_errors;
        self.kafka_errors += other.kafka_errors;
        self.kafka_timeouts += other.kafka_timeouts;
    }
}

/// Periodic status report for a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub file_name: String,
    pub state: String,
    pub partitions: HashMap<String, PartitionCounters>,
    pub writes_done: u64,
    pub write_errors: u64,
}

/// Terminal record emitted exactly once per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub status: JobOutcome,
    pub reason: String,
    pub counters: PartitionCounters,
    pub writes_done: u64,
    pub write_errors: u64,
}
