//! Fixed-size decode worker pool
//!
//! Each worker is a named OS thread that pulls jobs from the shared
//! `JobQueue` until the queue shuts down. Decoding is synchronous CPU and I/O
//! work, so plain threads fit better than async tasks here.

use super::queue::{Job, JobQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start `threads` workers (at least one) running `run` for every job
    pub fn spawn<F>(threads: usize, queue: Arc<JobQueue>, run: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let size = threads.max(1);
        let mut handles = Vec::with_capacity(size);

        for idx in 0..size {
            let queue = queue.clone();
            let run = run.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("preview-worker-{}", idx))
                .spawn(move || {
                    while let Some(job) = queue.next() {
                        run(job);
                    }
                    debug!(worker = idx, "worker exiting");
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(worker = idx, error = %e, "failed to spawn decode worker"),
            }
        }

        debug!(workers = handles.len(), "decode worker pool started");
        Self {
            handles: Mutex::new(handles),
            size,
        }
    }

    /// Requested pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker to exit. The queue must already be shut down.
    pub fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in handles {
            // A worker dropping the last pipeline handle must not join itself
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("decode worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("size", &self.size).finish()
    }
}
