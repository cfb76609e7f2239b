//! Job-level composition: partitions, the writer loop and the run-state
//! machine.

use crate::cancel::CancellationToken;
use crate::consumer::{ConsumerError, ConsumerFactory};
use crate::executor::{Executor, ThreadedExecutor};
use crate::filter::SourceFilter;
use crate::partition::{Partition, PartitionHandle};
use crate::writer_loop::{MessageWriter, WriterLoopStats};
use nexflow_protocol::commands::StartRequest;
use nexflow_protocol::status::{JobOutcome, JobReport, JobResult, PartitionCounters};
use nexflow_protocol::types::{JobId, ServiceId, TimeStampMs};
use nexflow_protocol::defaults;
use nexflow_schema::registry::ReaderRegistry;
use nexflow_writer::task::WriterTask;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Monotonic job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunState {
    Starting = 0,
    Running = 1,
    Finishing = 2,
    Removable = 3,
}

impl RunState {
    fn from_u8(value: u8) -> RunState {
        match value {
            0 => RunState::Starting,
            1 => RunState::Running,
            2 => RunState::Finishing,
            _ => RunState::Removable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Finishing => "finishing",
            RunState::Removable => "removable",
        }
    }
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("consumer setup failed: {0}")]
    Consumer(#[from] ConsumerError),
    #[error("job has no configured streams")]
    NoStreams,
}

/// Engine timings; the defaults are the service values, tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    pub stop_leeway: Duration,
    pub poll_timeout: Duration,
    pub kafka_error_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            stop_leeway: defaults::STOP_LEEWAY,
            poll_timeout: defaults::POLL_TIMEOUT,
            kafka_error_timeout: defaults::KAFKA_ERROR_TIMEOUT,
        }
    }
}

/// Callback invoked exactly once with the terminal job record.
pub type ResultCallback = Box<dyn FnOnce(JobResult) + Send>;

/// Owns one job: its writer loop, its partitions and its timeline.
pub struct StreamMaster {
    job_id: JobId,
    service_id: ServiceId,
    file_name: String,
    partitions: Vec<PartitionHandle>,
    // executors are held only to keep the partition worker threads alive
    _executors: Vec<Arc<dyn Executor>>,
    writer_stats: Arc<WriterLoopStats>,
    state: Arc<AtomicU8>,
    stop_requested: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    result: Arc<Mutex<Option<JobResult>>>,
}

impl StreamMaster {
    /// Build the job from a validated start command: one consumer per
    /// topic-partition of every topic the writer task demuxes, one filter
    /// per configured source on that topic.
    pub fn from_start_command(
        start: &StartRequest,
        task: WriterTask,
        reader_registry: Arc<ReaderRegistry>,
        consumer_factory: &dyn ConsumerFactory,
        config: MasterConfig,
        on_result: ResultCallback,
    ) -> Result<Self, MasterError> {
        let demux = task.demux().clone();
        if demux.is_empty() {
            return Err(MasterError::NoStreams);
        }

        // create every consumer before starting anything, so a failing
        // topic cannot leave already-started partitions orphaned
        let mut bound_consumers = Vec::new();
        for (topic, keys) in &demux {
            let consumers = consumer_factory.create_consumers(&start.broker, topic)?;
            for (partition_id, consumer) in consumers {
                bound_consumers.push((topic.clone(), keys.clone(), partition_id, consumer));
            }
        }

        let writer = MessageWriter::start(task);
        let writer_stats = writer.stats();
        let writer_tx = writer.sender();

        let mut partitions = Vec::new();
        let mut executors: Vec<Arc<dyn Executor>> = Vec::new();
        for (topic, keys, partition_id, consumer) in bound_consumers {
            let mut filters = HashMap::new();
            for key in keys {
                filters.insert(
                    key,
                    SourceFilter::new(
                        start.start_time,
                        start.stop_time,
                        config.stop_leeway,
                        key,
                        writer_tx.clone(),
                    ),
                );
            }
            let partition = Partition::new(
                consumer,
                partition_id,
                topic.clone(),
                filters,
                reader_registry.clone(),
                start.stop_time,
                config.stop_leeway,
                config.poll_timeout,
                config.kafka_error_timeout,
            );
            let executor: Arc<dyn Executor> =
                Arc::new(ThreadedExecutor::new(&format!("{}-{}", topic, partition_id)));
            partitions.push(PartitionHandle::start(partition, executor.clone()));
            executors.push(executor);
        }

        Ok(Self::assemble(
            start.job_id.clone(),
            ServiceId::new(start.service_id.clone().unwrap_or_default()),
            start.filename.clone(),
            partitions,
            executors,
            writer,
            writer_stats,
            on_result,
        ))
    }

    /// Composition seam used by tests: pre-built partitions, started
    /// writer loop.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        job_id: JobId,
        service_id: ServiceId,
        file_name: String,
        partitions: Vec<PartitionHandle>,
        executors: Vec<Arc<dyn Executor>>,
        writer: MessageWriter,
        writer_stats: Arc<WriterLoopStats>,
        on_result: ResultCallback,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(RunState::Starting as u8));
        let stop_requested = CancellationToken::new();
        let result = Arc::new(Mutex::new(None));

        let master = Self {
            job_id: job_id.clone(),
            service_id: service_id.clone(),
            file_name,
            partitions,
            _executors: executors,
            writer_stats: writer_stats.clone(),
            state: state.clone(),
            stop_requested: stop_requested.clone(),
            supervisor: None,
            result: result.clone(),
        };
        master.start(writer, on_result)
    }

    fn start(mut self, writer: MessageWriter, on_result: ResultCallback) -> Self {
        advance_state(&self.state, RunState::Running);
        info!(job_id = %self.job_id, "StreamMaster: start");

        let state = self.state.clone();
        let stop_requested = self.stop_requested.clone();
        let result_slot = self.result.clone();
        let job_id = self.job_id.clone();
        let service_id = self.service_id.clone();
        let writer_stats = self.writer_stats.clone();
        // clones share partition state with the handles the master keeps
        let partition_views: Vec<PartitionHandle> = self.partitions.to_vec();

        let supervisor = std::thread::Builder::new()
            .name(format!("nexflow-master-{}", job_id))
            .spawn(move || {
                let mut stop_forwarded = false;
                loop {
                    if stop_requested.is_cancelled() && !stop_forwarded {
                        for view in &partition_views {
                            view.request_stop();
                        }
                        stop_forwarded = true;
                    }
                    let all_finished = partition_views.iter().all(|view| view.has_finished());
                    if all_finished {
                        break;
                    }
                    std::thread::sleep(defaults::SUPERVISOR_TICK);
                }

                advance_state(&state, RunState::Finishing);
                info!(job_id = %job_id, "StreamMaster: finishing");

                let mut counters = PartitionCounters::default();
                for view in &partition_views {
                    counters.accumulate(&view.stats());
                }

                let (outcome, reason) = match writer.stop_and_join() {
                    Ok(_task) => (JobOutcome::Success, String::new()),
                    Err(e) => {
                        error!(job_id = %job_id, "Writer task failed: {e}");
                        (JobOutcome::Failure, e)
                    }
                };

                let job_result = JobResult {
                    job_id: job_id.clone(),
                    service_id,
                    status: outcome,
                    reason,
                    counters,
                    writes_done: writer_stats.writes_done(),
                    write_errors: writer_stats.write_errors(),
                };
                *result_slot.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(job_result.clone());
                on_result(job_result);

                advance_state(&state, RunState::Removable);
                info!(job_id = %job_id, "StreamMaster is removable");
            })
            .ok();

        self.supervisor = supervisor;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Forward a new stop time; legal in any non-terminal state.
    pub fn set_stop_time(&self, stop_time: TimeStampMs) {
        if self.run_state() >= RunState::Finishing {
            warn!(job_id = %self.job_id, "Ignoring stop time for a finishing job");
            return;
        }
        for partition in &self.partitions {
            partition.set_stop_time(stop_time);
        }
    }

    /// Non-blocking, idempotent; the internal driver reaches Removable
    /// asynchronously.
    pub fn request_stop(&self) {
        self.stop_requested.cancel();
    }

    pub fn is_removable(&self) -> bool {
        self.run_state() == RunState::Removable
    }

    /// Block until the supervisor lands on Removable. Test and teardown
    /// helper; command handling never calls this.
    pub fn wait_until_removable(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while !self.is_removable() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        true
    }

    /// Snapshot for the periodic status report.
    pub fn report(&self) -> JobReport {
        let partitions = self
            .partitions
            .iter()
            .map(|p| {
                (
                    format!("{}:{}", p.topic(), p.partition_id()),
                    p.stats(),
                )
            })
            .collect();
        JobReport {
            job_id: self.job_id.clone(),
            service_id: self.service_id.clone(),
            file_name: self.file_name.clone(),
            state: self.run_state().as_str().to_string(),
            partitions,
            writes_done: self.writer_stats.writes_done(),
            write_errors: self.writer_stats.write_errors(),
        }
    }

    /// The terminal record, present once the job reached Removable.
    pub fn result(&self) -> Option<JobResult> {
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for StreamMaster {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        info!(job_id = %self.job_id, "Stopped StreamMaster for job");
    }
}

impl std::fmt::Debug for StreamMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMaster")
            .field("job_id", &self.job_id)
            .field("state", &self.run_state())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

fn advance_state(state: &AtomicU8, to: RunState) {
    // states only move forward
    state.fetch_max(to as u8, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerInterface, MockConsumer, PollStatus};
    use nexflow_protocol::commands::Command;
    use nexflow_protocol::types::BrokerAddr;
    use nexflow_schema::f144::{F144Reader, LogFrameBuilder, ScalarValue};
    use nexflow_schema::message::{FlatbufferMessage, MessageMetaData};
    use nexflow_writer::registry::default_registry;
    use std::collections::HashMap as StdHashMap;
    use std::sync::mpsc;

    const MS: u64 = 1_000_000;
    const START_MS: u64 = 1_000;
    const STOP_MS: u64 = 2_000;

    fn reader_registry() -> Arc<ReaderRegistry> {
        let mut registry = ReaderRegistry::new();
        registry.register("f144", Arc::new(F144Reader)).unwrap();
        Arc::new(registry)
    }

    fn start_request(dir: &tempfile::TempDir, stop_ms: u64) -> StartRequest {
        let payload = serde_json::json!({
            "cmd": "FileWriter_new",
            "job_id": "job-1",
            "service_id": "fw-test",
            "broker": "//localhost:9092",
            "file_attributes": {"file_name": dir.path().join("out.h5").to_str().unwrap()},
            "start_time": START_MS,
            "stop_time": stop_ms,
            "nexus_structure": {"children": [{
                "type": "group",
                "name": "entry",
                "children": [{
                    "type": "group",
                    "name": "temperature",
                    "children": [{
                        "type": "stream",
                        "stream": {
                            "topic": "sample_env",
                            "source": "temp_1",
                            "writer_module": "f144",
                            "type": "float64"
                        }
                    }]
                }]
            }]}
        });
        let parsed = Command::parse(
            &serde_json::to_vec(&payload).unwrap(),
            TimeStampMs::new(START_MS),
        )
        .unwrap();
        match parsed {
            Command::Start(start) => start,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn frame(ts_ms: u64, value: f64) -> PollStatus {
        PollStatus::Message(FlatbufferMessage::new(
            LogFrameBuilder::new("temp_1")
                .timestamp_ns(ts_ms * MS)
                .scalar(ScalarValue::F64(value))
                .encode(),
            MessageMetaData {
                timestamp: TimeStampMs::new(ts_ms),
                partition: 0,
                offset: 0,
            },
        ))
    }

    /// Hands each topic-partition a pre-scripted consumer.
    struct ScriptedFactory {
        scripts: Mutex<StdHashMap<String, Vec<Vec<PollStatus>>>>,
    }

    impl ScriptedFactory {
        fn new(scripts: StdHashMap<String, Vec<Vec<PollStatus>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
            }
        }
    }

    impl ConsumerFactory for ScriptedFactory {
        fn create_consumers(
            &self,
            _broker: &BrokerAddr,
            topic: &str,
        ) -> Result<Vec<(i32, Box<dyn ConsumerInterface>)>, ConsumerError> {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            let partition_scripts = scripts
                .remove(topic)
                .ok_or_else(|| ConsumerError::UnknownTopic(topic.to_string()))?;
            Ok(partition_scripts
                .into_iter()
                .enumerate()
                .map(|(id, script)| {
                    (
                        id as i32,
                        Box::new(MockConsumer::with_script(script)) as Box<dyn ConsumerInterface>,
                    )
                })
                .collect())
        }
    }

    fn tight_config() -> MasterConfig {
        MasterConfig {
            stop_leeway: Duration::from_millis(0),
            poll_timeout: Duration::from_millis(10),
            kafka_error_timeout: Duration::from_secs(10),
        }
    }

    fn build_master(
        dir: &tempfile::TempDir,
        start: &StartRequest,
        factory: &ScriptedFactory,
    ) -> (StreamMaster, mpsc::Receiver<JobResult>) {
        let task = nexflow_writer::task::WriterTask::create(
            dir.path().join("out.h5").as_path(),
            "out.h5",
            &start.nexus_structure,
            &default_registry(),
            false,
            false,
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let master = StreamMaster::from_start_command(
            start,
            task,
            reader_registry(),
            factory,
            tight_config(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
        (master, rx)
    }

    #[test]
    fn job_runs_to_removable_and_emits_terminal_record() {
        let dir = tempfile::tempdir().unwrap();
        let start = start_request(&dir, STOP_MS);
        let factory = ScriptedFactory::new(StdHashMap::from([(
            "sample_env".to_string(),
            vec![vec![
                frame(1_100, 1.0),
                frame(1_200, 2.0),
                // past stop + leeway: closes the filter, then the partition
                frame(STOP_MS + 1_000, 9.0),
            ]],
        )]));
        let (mut master, result_rx) = build_master(&dir, &start, &factory);

        assert!(master.wait_until_removable(Duration::from_secs(10)));
        assert_eq!(master.run_state(), RunState::Removable);

        let result = result_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.status, JobOutcome::Success);
        assert_eq!(result.counters.messages_received, 3);
        assert_eq!(result.counters.messages_processed, 2);
        assert_eq!(result.writes_done, 2);
        assert_eq!(master.result().unwrap().job_id.as_str(), "job-1");

        // the writer loop closed the file before Removable
        assert!(master.writer_stats.file_closed());

        let report = master.report();
        assert_eq!(report.state, "removable");
        assert_eq!(report.partitions.len(), 1);
    }

    #[test]
    fn request_stop_drives_an_open_ended_job_to_removable() {
        let dir = tempfile::tempdir().unwrap();
        let start = start_request(&dir, 0); // stop_time 0 → open-ended
        assert_eq!(start.stop_time, TimeStampMs::MAX);
        let factory = ScriptedFactory::new(StdHashMap::from([(
            "sample_env".to_string(),
            vec![vec![frame(TimeStampMs::now().as_millis(), 1.0)]],
        )]));
        let (mut master, _result_rx) = build_master(&dir, &start, &factory);
        assert!(master.run_state() >= RunState::Running);

        master.request_stop();
        master.request_stop(); // idempotent
        assert!(master.wait_until_removable(Duration::from_secs(10)));
    }

    #[test]
    fn state_is_monotonic_and_stop_time_updates_are_ignored_when_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let start = start_request(&dir, STOP_MS);
        let factory = ScriptedFactory::new(StdHashMap::from([(
            "sample_env".to_string(),
            vec![vec![frame(STOP_MS + 1_000, 0.0)]],
        )]));
        let (mut master, _rx) = build_master(&dir, &start, &factory);
        assert!(master.wait_until_removable(Duration::from_secs(10)));
        let state_before = master.run_state();
        master.set_stop_time(TimeStampMs::new(STOP_MS + 100));
        assert_eq!(master.run_state(), state_before);
    }

    #[test]
    fn two_partitions_of_one_source_each_admit_independently() {
        let dir = tempfile::tempdir().unwrap();
        let start = start_request(&dir, STOP_MS);
        let factory = ScriptedFactory::new(StdHashMap::from([(
            "sample_env".to_string(),
            vec![
                vec![
                    frame(1_100, 1.0),
                    frame(1_300, 2.0),
                    frame(STOP_MS + 1_000, 0.0),
                ],
                vec![
                    frame(1_100, 10.0),
                    frame(1_200, 20.0),
                    frame(STOP_MS + 1_000, 0.0),
                ],
            ],
        )]));
        let (mut master, result_rx) = build_master(&dir, &start, &factory);
        assert!(master.wait_until_removable(Duration::from_secs(10)));
        let result = result_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        // both partitions admit their own monotonic sequence for the key
        assert_eq!(result.writes_done, 4);
        assert_eq!(result.counters.messages_processed, 4);
    }

    #[test]
    fn empty_demux_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let start = start_request(&dir, STOP_MS);
        let structure: nexflow_protocol::nexus::NexusStructure =
            serde_json::from_value(serde_json::json!({"children": [
                {"type": "group", "name": "entry", "children": []}
            ]}))
            .unwrap();
        let task = nexflow_writer::task::WriterTask::create(
            dir.path().join("out.h5").as_path(),
            "out.h5",
            &structure,
            &default_registry(),
            false,
            false,
        )
        .unwrap();
        let factory = ScriptedFactory::new(StdHashMap::new());
        let result = StreamMaster::from_start_command(
            &start,
            task,
            reader_registry(),
            &factory,
            tight_config(),
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(MasterError::NoStreams)));
    }
}
