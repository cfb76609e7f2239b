//! Job executors for the per-partition poll loops.

use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;
use tracing::debug;

pub type Job = Box<dyn FnOnce() + Send>;

/// Accepts work for one partition. Submission order is execution order,
/// which is what establishes the happens-before between a stop-time
/// update and the next processed message.
pub trait Executor: Send + Sync {
    fn send_work(&self, job: Job);
}

/// Runs every job inline; the deterministic mode used by tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn send_work(&self, job: Job) {
        job();
    }
}

/// One worker thread draining a job queue; dropped executors drain their
/// queue and join.
#[derive(Debug)]
pub struct ThreadedExecutor {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedExecutor {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let thread_name = format!("nexflow-{}", name);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("executor '{}' drained", thread_name);
            })
            .ok();
        Self {
            tx: Some(tx),
            handle,
        }
    }
}

impl Executor for ThreadedExecutor {
    fn send_work(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // receiver gone means we are shutting down; drop the job
            let _ = tx.send(job);
        }
    }
}

impl Drop for ThreadedExecutor {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            // the last reference can be released by a job running on the
            // worker itself; joining from there would deadlock
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn immediate_executor_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = ImmediateExecutor;
        let c = counter.clone();
        executor.send_work(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn threaded_executor_runs_submitted_jobs_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let executor = ThreadedExecutor::new("test");
            for i in 0..5 {
                let log = log.clone();
                executor.send_work(Box::new(move || {
                    log.lock().unwrap().push(i);
                }));
            }
            // drop joins the worker after the queue drains
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
