//! Command handling: owns the stream masters, keyed by job id.

use crate::status::StatusReporter;
use nexflow_protocol::commands::{Command, StartRequest, StopRequest};
use nexflow_protocol::status::JobReport;
use nexflow_protocol::types::{JobId, ServiceId, TimeStampMs};
use nexflow_schema::registry::ReaderRegistry;
use nexflow_stream::consumer::ConsumerFactory;
use nexflow_stream::master::{MasterConfig, StreamMaster};
use nexflow_writer::registry::WriterRegistry;
use nexflow_writer::task::WriterTask;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the handler needs, built once at startup and passed in
/// explicitly; tests assemble their own.
pub struct HandlerConfig {
    pub service_id: ServiceId,
    pub reader_registry: Arc<ReaderRegistry>,
    pub writer_registry: WriterRegistry,
    pub consumer_factory: Box<dyn ConsumerFactory>,
    pub reporter: Arc<dyn StatusReporter>,
    pub master_config: MasterConfig,
    /// Relative output filenames land here.
    pub output_dir: PathBuf,
}

/// Accepts commands, constructs and tears down stream masters.
pub struct Handler {
    config: HandlerConfig,
    masters: HashMap<JobId, StreamMaster>,
    exit_requested: bool,
}

impl Handler {
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            masters: HashMap::new(),
            exit_requested: false,
        }
    }

    /// Parse and dispatch one raw command payload.
    pub fn handle_payload(&mut self, payload: &[u8]) {
        match Command::parse(payload, TimeStampMs::now()) {
            Ok(command) => self.handle_command(command),
            Err(e) => {
                self.config
                    .reporter
                    .command_rejected(None, &e.to_string());
            }
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        if !self.config.service_id.accepts(command.service_id()) {
            // addressed to a different process; not ours to acknowledge
            debug!(
                service_id = %self.config.service_id,
                "Ignoring command for service '{}'",
                command.service_id().unwrap_or_default()
            );
            return;
        }
        match command {
            Command::Start(start) => self.start_job(start),
            Command::Stop(stop) => self.stop_job(stop),
            Command::StopAll { .. } => self.stop_all(),
            Command::Exit { .. } => {
                info!("Exit requested");
                self.exit_requested = true;
            }
        }
    }

    fn start_job(&mut self, start: StartRequest) {
        self.prune_removable();
        if self.masters.contains_key(&start.job_id) {
            warn!(job_id = %start.job_id, "Ignoring start for an already-running job id");
            self.config
                .reporter
                .command_rejected(Some(&start.job_id), "job id is already running");
            return;
        }

        let file_path = self.resolve_output_path(&start.filename);
        let task = match WriterTask::create(
            &file_path,
            &start.filename,
            &start.nexus_structure,
            &self.config.writer_registry,
            start.use_hdf_swmr,
            start.abort_on_uninitialised_stream,
        ) {
            Ok(task) => task,
            Err(e) => {
                warn!(job_id = %start.job_id, "Rejecting start command: {e}");
                self.config
                    .reporter
                    .command_rejected(Some(&start.job_id), &e.to_string());
                return;
            }
        };

        let reporter = self.config.reporter.clone();
        let master = StreamMaster::from_start_command(
            &start,
            task,
            self.config.reader_registry.clone(),
            self.config.consumer_factory.as_ref(),
            self.config.master_config,
            Box::new(move |result| reporter.job_result(&result)),
        );
        match master {
            Ok(master) => {
                info!(job_id = %start.job_id, file = %file_path.display(), "Job started");
                self.masters.insert(start.job_id.clone(), master);
            }
            Err(e) => {
                warn!(job_id = %start.job_id, "Rejecting start command: {e}");
                self.config
                    .reporter
                    .command_rejected(Some(&start.job_id), &e.to_string());
            }
        }
    }

    fn stop_job(&mut self, stop: StopRequest) {
        let Some(master) = self.masters.get(&stop.job_id) else {
            warn!(job_id = %stop.job_id, "Ignoring stop for unknown job id");
            return;
        };
        match stop.stop_time {
            Some(stop_time) => {
                info!(job_id = %stop.job_id, %stop_time, "Stop time set");
                master.set_stop_time(stop_time);
            }
            None => {
                info!(job_id = %stop.job_id, "Immediate stop requested");
                master.request_stop();
            }
        }
    }

    fn stop_all(&mut self) {
        info!(jobs = self.masters.len(), "Stopping every job");
        for master in self.masters.values() {
            master.request_stop();
        }
    }

    fn resolve_output_path(&self, filename: &str) -> PathBuf {
        let candidate = Path::new(filename);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.config.output_dir.join(candidate)
        }
    }

    /// Drop masters that reached Removable.
    pub fn prune_removable(&mut self) {
        self.masters.retain(|job_id, master| {
            if master.is_removable() {
                info!(job_id = %job_id, "Removing finished job");
                false
            } else {
                true
            }
        });
    }

    pub fn active_jobs(&self) -> usize {
        self.masters.len()
    }

    pub fn has_job(&self, job_id: &JobId) -> bool {
        self.masters.contains_key(job_id)
    }

    pub fn should_exit(&self) -> bool {
        self.exit_requested
    }

    /// Snapshot every running job for the periodic status tick.
    pub fn reports(&self) -> Vec<JobReport> {
        self.masters.values().map(StreamMaster::report).collect()
    }

    /// Teardown: stop everything and wait for the masters to wind down.
    pub fn shutdown(&mut self, timeout: std::time::Duration) {
        self.stop_all();
        let deadline = std::time::Instant::now() + timeout;
        for master in self.masters.values_mut() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if !master.wait_until_removable(remaining) {
                warn!(job_id = %master.job_id(), "Job did not reach removable before shutdown");
            }
        }
        self.masters.clear();
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("service_id", &self.config.service_id)
            .field("active_jobs", &self.masters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CollectingReporter, StatusEvent};
    use nexflow_protocol::status::JobOutcome;
    use nexflow_schema::f144::F144Reader;
    use nexflow_stream::consumer::MockConsumerFactory;
    use nexflow_writer::registry::default_registry;
    use std::time::Duration;

    fn reader_registry() -> Arc<ReaderRegistry> {
        let mut registry = ReaderRegistry::new();
        registry.register("f144", Arc::new(F144Reader)).unwrap();
        Arc::new(registry)
    }

    struct Fixture {
        handler: Handler,
        reporter: CollectingReporter,
        _dir: tempfile::TempDir,
    }

    fn fixture(service_id: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CollectingReporter::new();
        let config = HandlerConfig {
            service_id: ServiceId::new(service_id),
            reader_registry: reader_registry(),
            writer_registry: default_registry(),
            consumer_factory: Box::new(MockConsumerFactory::new(1)),
            reporter: Arc::new(reporter.clone()),
            master_config: MasterConfig {
                stop_leeway: Duration::from_millis(0),
                poll_timeout: Duration::from_millis(10),
                kafka_error_timeout: Duration::from_secs(10),
            },
            output_dir: dir.path().to_path_buf(),
        };
        Fixture {
            handler: Handler::new(config),
            reporter,
            _dir: dir,
        }
    }

    fn start_payload(job_id: &str, service_id: Option<&str>) -> Vec<u8> {
        let mut value = serde_json::json!({
            "cmd": "FileWriter_new",
            "job_id": job_id,
            "broker": "//localhost:9092",
            "file_attributes": {"file_name": format!("{job_id}.h5")},
            "start_time": 1_000u64,
            "stop_time": 0u64,
            "nexus_structure": {"children": [{
                "type": "group",
                "name": "entry",
                "children": [{
                    "type": "stream",
                    "stream": {
                        "topic": "sample_env",
                        "source": "temp_1",
                        "writer_module": "f144",
                        "type": "float64"
                    }
                }]
            }]}
        });
        if let Some(id) = service_id {
            value["service_id"] = serde_json::json!(id);
        }
        serde_json::to_vec(&value).unwrap()
    }

    fn stop_payload(job_id: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "cmd": "FileWriter_stop",
            "job_id": job_id
        }))
        .unwrap()
    }

    #[test]
    fn start_creates_a_job() {
        let mut f = fixture("");
        f.handler.handle_payload(&start_payload("job-1", None));
        assert_eq!(f.handler.active_jobs(), 1);
        assert!(f.handler.has_job(&JobId::new("job-1")));
        f.handler.shutdown(Duration::from_secs(10));
    }

    #[test]
    fn duplicate_job_id_is_rejected_with_warning() {
        let mut f = fixture("");
        f.handler.handle_payload(&start_payload("job-1", None));
        f.handler.handle_payload(&start_payload("job-1", None));
        assert_eq!(f.handler.active_jobs(), 1);
        assert_eq!(
            f.reporter.rejections(),
            vec!["job id is already running".to_string()]
        );
        f.handler.shutdown(Duration::from_secs(10));
    }

    #[test]
    fn command_for_other_service_is_silently_ignored() {
        let mut f = fixture("fw-1");
        f.handler
            .handle_payload(&start_payload("job-1", Some("fw-2")));
        assert_eq!(f.handler.active_jobs(), 0);
        assert!(f.reporter.events().is_empty());
    }

    #[test]
    fn command_without_service_id_is_accepted_by_named_service() {
        let mut f = fixture("fw-1");
        f.handler.handle_payload(&start_payload("job-1", None));
        assert_eq!(f.handler.active_jobs(), 1);
        f.handler.shutdown(Duration::from_secs(10));
    }

    #[test]
    fn malformed_payload_is_acknowledged_with_reason() {
        let mut f = fixture("");
        f.handler.handle_payload(b"not json at all");
        assert_eq!(f.reporter.rejections().len(), 1);
    }

    #[test]
    fn stop_for_unknown_job_is_ignored_with_warning() {
        let mut f = fixture("");
        f.handler.handle_payload(&stop_payload("nope"));
        assert_eq!(f.handler.active_jobs(), 0);
    }

    #[test]
    fn stop_drives_job_to_completion_and_emits_result() {
        let mut f = fixture("");
        f.handler.handle_payload(&start_payload("job-1", None));
        f.handler.handle_payload(&stop_payload("job-1"));
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while f.handler.active_jobs() > 0 && std::time::Instant::now() < deadline {
            f.handler.prune_removable();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(f.handler.active_jobs(), 0);
        let results = f.reporter.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobOutcome::Success);
    }

    #[test]
    fn stop_all_tears_down_every_job() {
        let mut f = fixture("");
        f.handler.handle_payload(&start_payload("job-1", None));
        f.handler.handle_payload(&start_payload("job-2", None));
        assert_eq!(f.handler.active_jobs(), 2);
        f.handler
            .handle_payload(serde_json::to_vec(&serde_json::json!({"cmd": "FileWriter_stop_all"})).unwrap().as_slice());
        f.handler.shutdown(Duration::from_secs(10));
        assert_eq!(f.handler.active_jobs(), 0);
        assert_eq!(f.reporter.results().len(), 2);
    }

    #[test]
    fn exit_command_sets_exit_flag() {
        let mut f = fixture("");
        assert!(!f.handler.should_exit());
        f.handler
            .handle_payload(serde_json::to_vec(&serde_json::json!({"cmd": "FileWriter_exit"})).unwrap().as_slice());
        assert!(f.handler.should_exit());
    }

    #[test]
    fn bad_structure_with_abort_flag_rejects_before_start() {
        let mut f = fixture("");
        let payload = serde_json::to_vec(&serde_json::json!({
            "cmd": "FileWriter_new",
            "job_id": "job-x",
            "broker": "//localhost:9092",
            "file_attributes": {"file_name": "job-x.h5"},
            "abort_on_uninitialised_stream": true,
            "nexus_structure": {"children": [{
                "type": "group",
                "name": "entry",
                "children": [{
                    "type": "stream",
                    "stream": {"topic": "t", "source": "s", "writer_module": "zzzz"}
                }]
            }]}
        }))
        .unwrap();
        f.handler.handle_payload(&payload);
        assert_eq!(f.handler.active_jobs(), 0);
        assert_eq!(f.reporter.rejections().len(), 1);
        assert!(matches!(
            f.reporter.events().first(),
            Some(StatusEvent::Rejected { job_id: Some(id), .. }) if id.as_str() == "job-x"
        ));
    }
}
