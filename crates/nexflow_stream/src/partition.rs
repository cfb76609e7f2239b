//! One consumer loop bound to a single topic-partition.

use crate::consumer::{ConsumerInterface, PollStatus};
use crate::executor::Executor;
use crate::filter::SourceFilter;
use nexflow_protocol::status::PartitionCounters;
use nexflow_protocol::types::{SourceKey, TimeStampMs};
use nexflow_schema::message::FlatbufferMessage;
use nexflow_schema::registry::ReaderRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Monotonic counters, written by the owning partition and read freely.
#[derive(Debug, Default)]
pub struct PartitionMetrics {
    pub messages_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub flatbuffer_errors: AtomicU64,
    pub kafka_errors: AtomicU64,
    pub kafka_timeouts: AtomicU64,
}

impl PartitionMetrics {
    pub fn snapshot(&self) -> PartitionCounters {
        PartitionCounters {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            flatbuffer_errors: self.flatbuffer_errors.load(Ordering::Relaxed),
            kafka_errors: self.kafka_errors.load(Ordering::Relaxed),
            kafka_timeouts: self.kafka_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Owns one consumer and the source filters configured for its topic.
pub struct Partition {
    consumer: Box<dyn ConsumerInterface>,
    partition_id: i32,
    topic: String,
    filters: HashMap<SourceKey, SourceFilter>,
    registry: Arc<ReaderRegistry>,
    metrics: Arc<PartitionMetrics>,
    stop_time: TimeStampMs,
    stop_leeway: Duration,
    poll_timeout: Duration,
    kafka_error_timeout: Duration,
    consecutive_timeouts: u32,
    errored: bool,
    finished: bool,
    consumer_closed: bool,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: Box<dyn ConsumerInterface>,
        partition_id: i32,
        topic: impl Into<String>,
        filters: HashMap<SourceKey, SourceFilter>,
        registry: Arc<ReaderRegistry>,
        stop_time: TimeStampMs,
        stop_leeway: Duration,
        poll_timeout: Duration,
        kafka_error_timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            partition_id,
            topic: topic.into(),
            filters,
            registry,
            metrics: Arc::new(PartitionMetrics::default()),
            stop_time: clamp_stop_time(stop_time, stop_leeway),
            stop_leeway,
            poll_timeout,
            kafka_error_timeout,
            consecutive_timeouts: 0,
            errored: false,
            finished: false,
            consumer_closed: false,
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metrics(&self) -> Arc<PartitionMetrics> {
        self.metrics.clone()
    }

    pub fn stop_time(&self) -> TimeStampMs {
        self.stop_time
    }

    pub fn stop_leeway(&self) -> Duration {
        self.stop_leeway
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Latched: once finished, stays finished.
    pub fn has_finished(&self) -> bool {
        self.finished
    }

    /// Propagate a new stop time to every filter; the clamp keeps
    /// `stop + leeway` representable.
    pub fn set_stop_time(&mut self, stop_time: TimeStampMs) {
        self.stop_time = clamp_stop_time(stop_time, self.stop_leeway);
        for filter in self.filters.values_mut() {
            filter.set_stop_time(stop_time);
        }
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    #[cfg(test)]
    pub(crate) fn filters(&self) -> &HashMap<SourceKey, SourceFilter> {
        &self.filters
    }

    /// One poll plus dispatch. The caller (executor loop) re-submits until
    /// the partition finishes.
    pub fn poll_for_message(&mut self) {
        if self.finished {
            return;
        }
        match self.consumer.poll() {
            PollStatus::Message(message) => {
                self.consecutive_timeouts = 0;
                self.metrics
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                let broker_time = message.meta().timestamp;
                if self.filters.is_empty() {
                    // a partition no job stream cares about; first message
                    // is the watchdog that shuts it down
                    self.finish();
                    return;
                }
                self.process_message(message);
                if self.past_close_out(broker_time) {
                    self.finish();
                }
            }
            PollStatus::Empty | PollStatus::EndOfPartition => {
                self.consecutive_timeouts = 0;
                self.finish_if_wall_clock_passed();
            }
            PollStatus::TimedOut => {
                self.metrics.kafka_timeouts.fetch_add(1, Ordering::Relaxed);
                self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
                let stalled = self.poll_timeout.saturating_mul(self.consecutive_timeouts);
                if !self.errored && stalled >= self.kafka_error_timeout {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition_id,
                        "No broker contact for {:?}, marking partition errored",
                        stalled
                    );
                    self.errored = true;
                }
                self.finish_if_wall_clock_passed();
            }
            PollStatus::Error => {
                self.metrics.kafka_errors.fetch_add(1, Ordering::Relaxed);
                self.finish_if_wall_clock_passed();
            }
        }
    }

    /// Route one received message through its source filter.
    pub fn process_message(&mut self, message: FlatbufferMessage) {
        let Some(reader) = self.registry.find_for_message(&message) else {
            self.metrics
                .flatbuffer_errors
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let reader = reader.clone();
        if !reader.verify(&message) {
            self.metrics
                .flatbuffer_errors
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(tag) = message.schema_tag() else {
            self.metrics
                .flatbuffer_errors
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let key = SourceKey::compute(tag, &reader.source_name(&message));
        let Some(filter) = self.filters.get_mut(&key) else {
            // stream not configured for this job
            debug!(topic = %self.topic, "Dropping message for unconfigured source");
            return;
        };
        let timestamp_ns = reader.timestamp_ns(&message);
        if filter.filter_message(timestamp_ns, message) {
            self.metrics
                .messages_processed
                .fetch_add(1, Ordering::Relaxed);
        }
        if filter.has_finished() {
            self.filters.remove(&key);
            if self.filters.is_empty() {
                self.finish();
            }
        }
    }

    fn past_close_out(&self, broker_time: TimeStampMs) -> bool {
        let leeway_ms = self.stop_leeway.as_millis() as u64;
        broker_time > self.stop_time.saturating_add(leeway_ms)
    }

    /// With no messages arriving, wall clock past `stop + leeway` is the
    /// shutdown signal. Open-ended jobs (stop at or clamped near the
    /// representable maximum) never trip this.
    fn finish_if_wall_clock_passed(&mut self) {
        let leeway_ms = self.stop_leeway.as_millis() as u64;
        if self.stop_time >= TimeStampMs::MAX.saturating_sub(leeway_ms) {
            return;
        }
        if self.past_close_out(TimeStampMs::now()) {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.filters.clear();
        self.close_consumer();
        info!(
            topic = %self.topic,
            partition = self.partition_id,
            "Partition finished"
        );
    }

    fn close_consumer(&mut self) {
        if !self.consumer_closed {
            self.consumer.close();
            self.consumer_closed = true;
        }
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.close_consumer();
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("topic", &self.topic)
            .field("partition_id", &self.partition_id)
            .field("filters", &self.filters.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Back a stop time off by the leeway when adding the leeway would
/// overflow the representation.
fn clamp_stop_time(stop_time: TimeStampMs, leeway: Duration) -> TimeStampMs {
    let leeway_ms = leeway.as_millis() as u64;
    if stop_time.overflows_with(leeway_ms) {
        stop_time.saturating_sub(leeway_ms)
    } else {
        stop_time
    }
}

/// A started partition: the state lives behind its executor, every
/// operation is submitted as work so updates order with message
/// processing. Clones share the same partition.
#[derive(Clone)]
pub struct PartitionHandle {
    inner: Arc<Mutex<Partition>>,
    executor: Arc<dyn Executor>,
    topic: String,
    partition_id: i32,
    metrics: Arc<PartitionMetrics>,
}

impl PartitionHandle {
    /// Wrap the partition and submit the first poll task.
    pub fn start(partition: Partition, executor: Arc<dyn Executor>) -> Self {
        let topic = partition.topic().to_string();
        let partition_id = partition.partition_id();
        let metrics = partition.metrics();
        let inner = Arc::new(Mutex::new(partition));
        add_poll_task(inner.clone(), executor.clone());
        Self {
            inner,
            executor,
            topic,
            partition_id,
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    pub fn set_stop_time(&self, stop_time: TimeStampMs) {
        let inner = self.inner.clone();
        self.executor.send_work(Box::new(move || {
            lock(&inner).set_stop_time(stop_time);
        }));
    }

    /// Stop as soon as the window allows; non-blocking.
    pub fn request_stop(&self) {
        self.set_stop_time(TimeStampMs::now());
    }

    pub fn has_finished(&self) -> bool {
        lock(&self.inner).has_finished()
    }

    pub fn is_errored(&self) -> bool {
        lock(&self.inner).is_errored()
    }

    pub fn stats(&self) -> PartitionCounters {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("topic", &self.topic)
            .field("partition_id", &self.partition_id)
            .finish()
    }
}

fn lock(inner: &Arc<Mutex<Partition>>) -> MutexGuard<'_, Partition> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn add_poll_task(inner: Arc<Mutex<Partition>>, executor: Arc<dyn Executor>) {
    let next_inner = inner.clone();
    let next_executor = executor.clone();
    executor.send_work(Box::new(move || {
        let finished = {
            let mut partition = lock(&next_inner);
            partition.poll_for_message();
            partition.has_finished()
        };
        if !finished {
            add_poll_task(next_inner, next_executor);
        }
    }));
}
