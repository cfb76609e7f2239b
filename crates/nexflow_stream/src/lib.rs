//! The nexflow streaming engine: per-partition consumer loops, per-source
//! filtering, the single-writer message loop and the job-level stream
//! master.
//!
//! Scheduling is single-threaded cooperative per partition: one in-flight
//! poll task at a time, re-submitted through the partition's [`Executor`].
//! All dataset appends funnel through one writer thread; nothing else
//! touches the file.

pub mod cancel;
pub mod consumer;
pub mod executor;
pub mod filter;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod master;
pub mod partition;
pub mod writer_loop;

pub use cancel::CancellationToken;
pub use consumer::{
    ConsumerError, ConsumerFactory, ConsumerInterface, MockConsumer, MockConsumerFactory,
    PollStatus,
};
pub use executor::{Executor, ImmediateExecutor, Job, ThreadedExecutor};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaConsumerFactory};
pub use filter::SourceFilter;
pub use master::{MasterConfig, MasterError, ResultCallback, RunState, StreamMaster};
pub use partition::{Partition, PartitionHandle, PartitionMetrics};
pub use writer_loop::{MessageWriter, WriteMessage, WriterCommand, WriterLoopStats};
