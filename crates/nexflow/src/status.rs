//! Status reporting: periodic job reports, terminal records and command
//! acknowledgements.
//!
//! The transport (a Kafka status producer in a full deployment) stays
//! behind the [`StatusReporter`] trait; the service logs reports as
//! structured JSON, tests collect them.

use nexflow_protocol::status::{JobReport, JobResult};
use nexflow_protocol::types::JobId;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Sink for everything the service tells the outside world about jobs.
pub trait StatusReporter: Send + Sync {
    fn job_report(&self, report: &JobReport);

    fn job_result(&self, result: &JobResult);

    /// A command was rejected before any job state changed.
    fn command_rejected(&self, job_id: Option<&JobId>, reason: &str);
}

/// Default reporter: structured log lines carrying the JSON payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn job_report(&self, report: &JobReport) {
        let payload = serde_json::to_string(report).unwrap_or_default();
        info!(job_id = %report.job_id, "status: {payload}");
    }

    fn job_result(&self, result: &JobResult) {
        let payload = serde_json::to_string(result).unwrap_or_default();
        info!(job_id = %result.job_id, "terminal: {payload}");
    }

    fn command_rejected(&self, job_id: Option<&JobId>, reason: &str) {
        match job_id {
            Some(id) => warn!(job_id = %id, "Command rejected: {reason}"),
            None => warn!("Command rejected: {reason}"),
        }
    }
}

/// One recorded reporter call.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Report(JobReport),
    Result(JobResult),
    Rejected {
        job_id: Option<JobId>,
        reason: String,
    },
}

/// Test reporter collecting every event.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn results(&self) -> Vec<JobResult> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StatusEvent::Result(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn rejections(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StatusEvent::Rejected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

impl StatusReporter for CollectingReporter {
    fn job_report(&self, report: &JobReport) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StatusEvent::Report(report.clone()));
    }

    fn job_result(&self, result: &JobResult) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StatusEvent::Result(result.clone()));
    }

    fn command_rejected(&self, job_id: Option<&JobId>, reason: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StatusEvent::Rejected {
                job_id: job_id.cloned(),
                reason: reason.to_string(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_reporter_records_rejections() {
        let reporter = CollectingReporter::new();
        reporter.command_rejected(Some(&JobId::new("j1")), "duplicate job id");
        reporter.command_rejected(None, "bad json");
        assert_eq!(
            reporter.rejections(),
            vec!["duplicate job id".to_string(), "bad json".to_string()]
        );
    }
}
