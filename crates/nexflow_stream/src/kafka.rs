//! rdkafka-backed implementation of the consumer contract: one
//! `BaseConsumer` pinned to a single topic-partition.

use crate::consumer::{ConsumerError, ConsumerFactory, ConsumerInterface, PollStatus};
use nexflow_protocol::types::{BrokerAddr, TimeStampMs};
use nexflow_schema::message::{FlatbufferMessage, MessageMetaData};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

fn base_config(broker: &BrokerAddr, topic: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", broker.host_port())
        .set(
            "group.id",
            format!("nexflow-{}-{}", topic, std::process::id()),
        )
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "true")
        .set("auto.offset.reset", "latest");
    config
}

/// One consumer bound to one topic-partition, positioned at the next new
/// message unless an explicit offset is assigned later.
pub struct KafkaConsumer {
    consumer: Option<BaseConsumer>,
    topic: String,
    partition: i32,
    poll_timeout: Duration,
}

impl KafkaConsumer {
    pub fn new(
        broker: &BrokerAddr,
        topic: &str,
        partition: i32,
        poll_timeout: Duration,
    ) -> Result<Self, ConsumerError> {
        let consumer: BaseConsumer = base_config(broker, topic)
            .create()
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::End)
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;
        info!(topic, partition, "Kafka consumer assigned");
        Ok(Self {
            consumer: Some(consumer),
            topic: topic.to_string(),
            partition,
            poll_timeout,
        })
    }
}

impl ConsumerInterface for KafkaConsumer {
    fn poll(&mut self) -> PollStatus {
        let Some(consumer) = &self.consumer else {
            return PollStatus::Error;
        };
        match consumer.poll(self.poll_timeout) {
            None => PollStatus::TimedOut,
            Some(Ok(message)) => {
                let Some(payload) = message.payload() else {
                    return PollStatus::Empty;
                };
                let timestamp = message
                    .timestamp()
                    .to_millis()
                    .map(|ms| ms.max(0) as u64)
                    .unwrap_or_default();
                PollStatus::Message(FlatbufferMessage::new(
                    payload.to_vec(),
                    MessageMetaData {
                        timestamp: TimeStampMs::new(timestamp),
                        partition: message.partition(),
                        offset: message.offset(),
                    },
                ))
            }
            Some(Err(KafkaError::PartitionEOF(_))) => PollStatus::EndOfPartition,
            Some(Err(e)) => {
                debug!(topic = %self.topic, partition = self.partition, "Poll error: {e}");
                PollStatus::Error
            }
        }
    }

    fn add_partition_at_offset(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), ConsumerError> {
        let Some(consumer) = &self.consumer else {
            return Err(ConsumerError::Assignment("consumer is closed".to_string()));
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| ConsumerError::Assignment(e.to_string()))?;
        self.topic = topic.to_string();
        self.partition = partition;
        Ok(())
    }

    fn assignment(&self) -> Vec<(String, i32)> {
        vec![(self.topic.clone(), self.partition)]
    }

    fn close(&mut self) {
        if self.consumer.take().is_some() {
            info!(topic = %self.topic, partition = self.partition, "Kafka consumer closed");
        }
    }
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

/// Queries topic metadata and hands out one consumer per partition.
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    pub poll_timeout: Duration,
    pub metadata_timeout: Duration,
}

impl Default for KafkaConsumerFactory {
    fn default() -> Self {
        Self {
            poll_timeout: nexflow_protocol::defaults::POLL_TIMEOUT,
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create_consumers(
        &self,
        broker: &BrokerAddr,
        topic: &str,
    ) -> Result<Vec<(i32, Box<dyn ConsumerInterface>)>, ConsumerError> {
        let probe: BaseConsumer = base_config(broker, topic)
            .create()
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;
        let metadata = probe
            .fetch_metadata(Some(topic), self.metadata_timeout)
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;
        let partition_ids: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        if partition_ids.is_empty() {
            return Err(ConsumerError::UnknownTopic(topic.to_string()));
        }
        let mut consumers: Vec<(i32, Box<dyn ConsumerInterface>)> = Vec::new();
        for id in partition_ids {
            let consumer = KafkaConsumer::new(broker, topic, id, self.poll_timeout)?;
            consumers.push((id, Box::new(consumer)));
        }
        Ok(consumers)
    }
}
