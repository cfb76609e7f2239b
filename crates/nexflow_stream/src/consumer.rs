//! The consumer contract the engine depends on, plus the scripted mock
//! used by tests and tools.

use nexflow_protocol::types::BrokerAddr;
use nexflow_schema::message::FlatbufferMessage;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("topic '{0}' has no partitions or does not exist")]
    UnknownTopic(String),
    #[error("assignment failed: {0}")]
    Assignment(String),
}

/// Outcome of one blocking poll.
#[derive(Debug)]
pub enum PollStatus {
    Message(FlatbufferMessage),
    Empty,
    TimedOut,
    EndOfPartition,
    Error,
}

/// One consumer bound to a single topic-partition.
///
/// `poll` blocks up to the configured timeout. Offset semantics are
/// "start from the next new message" unless an explicit offset was
/// configured through `add_partition_at_offset`.
pub trait ConsumerInterface: Send {
    fn poll(&mut self) -> PollStatus;

    fn add_partition_at_offset(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), ConsumerError>;

    fn assignment(&self) -> Vec<(String, i32)>;

    /// Release the underlying client. Called exactly once by the owning
    /// partition; later calls must be no-ops.
    fn close(&mut self);
}

/// Creates the consumers for every partition of a topic.
pub trait ConsumerFactory: Send + Sync {
    fn create_consumers(
        &self,
        broker: &BrokerAddr,
        topic: &str,
    ) -> Result<Vec<(i32, Box<dyn ConsumerInterface>)>, ConsumerError>;
}

/// Scripted consumer for deterministic tests: returns the queued statuses
/// in order, then `TimedOut` forever.
#[derive(Debug, Default)]
pub struct MockConsumer {
    script: VecDeque<PollStatus>,
    assigned: Vec<(String, i32)>,
    pub close_count: usize,
}

impl MockConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<PollStatus>) -> Self {
        Self {
            script: script.into(),
            assigned: Vec::new(),
            close_count: 0,
        }
    }

    pub fn enqueue(&mut self, status: PollStatus) {
        self.script.push_back(status);
    }
}

impl ConsumerInterface for MockConsumer {
    fn poll(&mut self) -> PollStatus {
        self.script.pop_front().unwrap_or(PollStatus::TimedOut)
    }

    fn add_partition_at_offset(
        &mut self,
        topic: &str,
        partition: i32,
        _offset: i64,
    ) -> Result<(), ConsumerError> {
        self.assigned.push((topic.to_string(), partition));
        Ok(())
    }

    fn assignment(&self) -> Vec<(String, i32)> {
        self.assigned.clone()
    }

    fn close(&mut self) {
        self.close_count += 1;
    }
}

/// Factory handing out one empty mock consumer per configured partition.
#[derive(Debug, Clone, Default)]
pub struct MockConsumerFactory {
    pub partitions_per_topic: i32,
}

impl MockConsumerFactory {
    pub fn new(partitions_per_topic: i32) -> Self {
        Self {
            partitions_per_topic,
        }
    }
}

impl ConsumerFactory for MockConsumerFactory {
    fn create_consumers(
        &self,
        _broker: &BrokerAddr,
        topic: &str,
    ) -> Result<Vec<(i32, Box<dyn ConsumerInterface>)>, ConsumerError> {
        if self.partitions_per_topic <= 0 {
            return Err(ConsumerError::UnknownTopic(topic.to_string()));
        }
        Ok((0..self.partitions_per_topic)
            .map(|id| {
                let mut consumer = MockConsumer::new();
                consumer.assigned.push((topic.to_string(), id));
                (id, Box::new(consumer) as Box<dyn ConsumerInterface>)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_consumer_replays_script_then_times_out() {
        let mut consumer = MockConsumer::with_script(vec![PollStatus::Empty, PollStatus::Error]);
        assert!(matches!(consumer.poll(), PollStatus::Empty));
        assert!(matches!(consumer.poll(), PollStatus::Error));
        assert!(matches!(consumer.poll(), PollStatus::TimedOut));
    }

    #[test]
    fn mock_consumer_counts_close_calls() {
        let mut consumer = MockConsumer::new();
        consumer.close();
        consumer.close();
        assert_eq!(consumer.close_count, 2);
    }

    #[test]
    fn mock_factory_creates_one_consumer_per_partition() {
        let factory = MockConsumerFactory::new(3);
        let broker = BrokerAddr::parse("//localhost:9092").unwrap();
        let consumers = factory.create_consumers(&broker, "some_topic").unwrap();
        assert_eq!(consumers.len(), 3);
        assert_eq!(consumers[2].0, 2);
    }
}
