//! Where raw command payloads come from.

use nexflow_stream::consumer::{ConsumerError, ConsumerInterface, PollStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Polls for the next raw command payload; `None` when nothing arrived
/// within the poll timeout.
pub trait CommandSource: Send {
    fn poll(&mut self) -> Result<Option<Vec<u8>>, ConsumerError>;
}

/// Command source over the consumer contract (the command topic).
pub struct ConsumerCommandSource {
    consumer: Box<dyn ConsumerInterface>,
}

impl ConsumerCommandSource {
    pub fn new(consumer: Box<dyn ConsumerInterface>) -> Self {
        Self { consumer }
    }
}

impl CommandSource for ConsumerCommandSource {
    fn poll(&mut self) -> Result<Option<Vec<u8>>, ConsumerError> {
        match self.consumer.poll() {
            PollStatus::Message(msg) => Ok(Some(msg.data().to_vec())),
            PollStatus::Empty
            | PollStatus::TimedOut
            | PollStatus::EndOfPartition
            | PollStatus::Error => Ok(None),
        }
    }
}

/// In-memory queue used by tests and local tooling. Clones push into the
/// same queue.
#[derive(Debug, Default, Clone)]
pub struct CommandQueue {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: Vec<u8>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(payload);
    }
}

impl CommandSource for CommandQueue {
    fn poll(&mut self) -> Result<Option<Vec<u8>>, ConsumerError> {
        Ok(self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front())
    }
}
