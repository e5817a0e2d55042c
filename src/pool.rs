//! Fixed worker pool shared by the executor and the scheduler loop.
//!
//! FIFO and unbounded: admission control is the rail's job, not the
//! pool's. Shutdown closes the channel and joins the workers, so queued
//! and in-flight jobs drain without being cancelled.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, size: usize) -> Self {
        assert!(size > 0, "worker pool needs at least one thread");
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("worker job panicked");
                        }
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => warn!(%error, "failed to spawn pool worker"),
            }
        }
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Hands the job back when the pool is already shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    /// Closes the queue and joins every worker after it drains. Idempotent.
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers = mem::take(&mut *self.workers.lock());
        if !workers.is_empty() {
            debug!(count = workers.len(), "joining pool workers");
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
