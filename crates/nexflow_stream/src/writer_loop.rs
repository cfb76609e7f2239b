//! The single-writer message loop.
//!
//! Every accepted message from every partition funnels through one
//! channel into one thread that owns the writer task. That thread is the
//! only code touching the file, so appends serialise without any
//! cross-partition lock.

use crossbeam_channel::{unbounded, Receiver, Sender};
use nexflow_protocol::types::SourceKey;
use nexflow_schema::message::FlatbufferMessage;
use nexflow_writer::task::WriterTask;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// One append routed to a writer instance.
#[derive(Debug)]
pub struct WriteMessage {
    pub destination: SourceKey,
    pub message: FlatbufferMessage,
    /// Timestamp override for the pre-start candidate.
    pub restamp: Option<u64>,
}

/// Control surface of the writer loop.
#[derive(Debug)]
pub enum WriterCommand {
    Write(WriteMessage),
    Flush,
    Stop,
}

/// Counters shared with the supervisor and the status reporter.
#[derive(Debug, Default)]
pub struct WriterLoopStats {
    pub writes_done: AtomicU64,
    pub write_errors: AtomicU64,
    pub file_closed: AtomicBool,
}

impl WriterLoopStats {
    pub fn writes_done(&self) -> u64 {
        self.writes_done.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn file_closed(&self) -> bool {
        self.file_closed.load(Ordering::SeqCst)
    }
}

/// Handle to the writer thread; owns the channel sender side.
pub struct MessageWriter {
    tx: Sender<WriterCommand>,
    handle: Option<JoinHandle<Result<WriterTask, String>>>,
    stats: Arc<WriterLoopStats>,
}

impl MessageWriter {
    /// Move the writer task onto its own thread and start draining.
    pub fn start(task: WriterTask) -> Self {
        let (tx, rx) = unbounded::<WriterCommand>();
        let stats = Arc::new(WriterLoopStats::default());
        let thread_stats = stats.clone();
        let handle = std::thread::Builder::new()
            .name("nexflow-writer".to_string())
            .spawn(move || run_writer(task, rx, thread_stats))
            .ok();
        Self {
            tx,
            handle,
            stats,
        }
    }

    /// Channel sender handed to every source filter; the non-owning
    /// reference to the writer instances.
    pub fn sender(&self) -> Sender<WriterCommand> {
        self.tx.clone()
    }

    pub fn stats(&self) -> Arc<WriterLoopStats> {
        self.stats.clone()
    }

    /// Stop the loop, close the file and hand the task back.
    pub fn stop_and_join(mut self) -> Result<WriterTask, String> {
        let _ = self.tx.send(WriterCommand::Stop);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| "writer thread panicked".to_string())?,
            None => Err("writer thread was never started".to_string()),
        }
    }
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("writes_done", &self.stats.writes_done())
            .field("write_errors", &self.stats.write_errors())
            .finish()
    }
}

fn run_writer(
    mut task: WriterTask,
    rx: Receiver<WriterCommand>,
    stats: Arc<WriterLoopStats>,
) -> Result<WriterTask, String> {
    loop {
        match rx.recv() {
            Ok(WriterCommand::Write(write)) => {
                match task.write(write.destination, &write.message, write.restamp) {
                    Ok(()) => {
                        stats.writes_done.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // a failed append drops the message, the stream continues
                        stats.write_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(destination = %write.destination, "Append failed: {e}");
                    }
                }
            }
            Ok(WriterCommand::Flush) => {
                if let Err(e) = task.flush() {
                    stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Flush failed: {e}");
                }
            }
            Ok(WriterCommand::Stop) => break,
            Err(_) => {
                debug!("writer channel closed without stop command");
                break;
            }
        }
    }
    let close_result = task.close();
    stats.file_closed.store(true, Ordering::SeqCst);
    match close_result {
        Ok(()) => Ok(task),
        Err(e) => {
            error!("Closing the output file failed: {e}");
            Err(e.to_string())
        }
    }
}
