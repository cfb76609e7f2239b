//! Per-source admission: the time-window state machine in front of one
//! writer instance.

use crate::writer_loop::{WriteMessage, WriterCommand};
use crossbeam_channel::Sender;
use nexflow_protocol::types::{SourceKey, TimeStampMs};
use nexflow_schema::message::FlatbufferMessage;
use std::time::Duration;
use tracing::debug;

/// Decides, per message, whether its source writes it.
///
/// Invariants kept here: accepted timestamps are strictly increasing per
/// source (identical timestamps are dropped), every accepted timestamp
/// lies inside `[start, stop + leeway]`, and the most recent pre-start
/// message lands re-stamped to the window start as the initial value.
pub struct SourceFilter {
    start_time: TimeStampMs,
    stop_time: TimeStampMs,
    stop_leeway: Duration,
    destination: SourceKey,
    writer: Sender<WriterCommand>,
    candidate: Option<FlatbufferMessage>,
    seen_any: bool,
    last_accepted_ns: u64,
    done: bool,
}

impl SourceFilter {
    pub fn new(
        start_time: TimeStampMs,
        stop_time: TimeStampMs,
        stop_leeway: Duration,
        destination: SourceKey,
        writer: Sender<WriterCommand>,
    ) -> Self {
        Self {
            start_time,
            stop_time,
            stop_leeway,
            destination,
            writer,
            candidate: None,
            seen_any: false,
            last_accepted_ns: 0,
            done: false,
        }
    }

    pub fn destination(&self) -> SourceKey {
        self.destination
    }

    pub fn stop_time(&self) -> TimeStampMs {
        self.stop_time
    }

    pub fn set_stop_time(&mut self, stop_time: TimeStampMs) {
        self.stop_time = stop_time;
    }

    pub fn has_finished(&self) -> bool {
        self.done
    }

    fn start_ns(&self) -> u64 {
        self.start_time.as_nanos()
    }

    fn close_out_ns(&self) -> u64 {
        self.stop_time
            .as_nanos()
            .saturating_add(self.stop_leeway.as_nanos() as u64)
    }

    /// Admit or drop one message; returns true when the message (and
    /// possibly a buffered pre-start candidate) went to the writer.
    pub fn filter_message(&mut self, timestamp_ns: u64, message: FlatbufferMessage) -> bool {
        if self.done {
            return false;
        }
        if timestamp_ns < self.start_ns() {
            // latest value before the window becomes the initial value
            self.candidate = Some(message);
            return false;
        }
        if timestamp_ns > self.close_out_ns() {
            debug!(
                destination = %self.destination,
                "Source passed the stop leeway, closing"
            );
            self.done = true;
            self.candidate = None;
            return false;
        }
        if self.seen_any && timestamp_ns <= self.last_accepted_ns {
            // one message per timestamp; reordered stragglers are dropped
            return false;
        }
        if let Some(candidate) = self.candidate.take() {
            self.send(WriteMessage {
                destination: self.destination,
                message: candidate,
                restamp: Some(self.start_ns()),
            });
        }
        self.send(WriteMessage {
            destination: self.destination,
            message,
            restamp: None,
        });
        self.seen_any = true;
        self.last_accepted_ns = timestamp_ns;
        true
    }

    fn send(&self, write: WriteMessage) {
        // a gone writer means the job is tearing down; nothing to do
        let _ = self.writer.send(WriterCommand::Write(write));
    }
}

impl std::fmt::Debug for SourceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFilter")
            .field("destination", &self.destination)
            .field("done", &self.done)
            .field("last_accepted_ns", &self.last_accepted_ns)
            .finish()
    }
}
