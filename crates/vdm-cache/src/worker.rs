//! Runs a batch of fetch tasks to completion.
//!
//! The cacher hands a [`TaskRunner`] every query it needs fetched plus the job that fetches and
//! stores one of them, and blocks until the runner returns. Production uses [`ThreadedRunner`];
//! [`InlineRunner`] runs on the caller's thread in a chosen order, which makes completion order
//! deterministic in tests.

use crate::error::{CacheError, Result};
use crate::query::FmqlQuery;
use crossbeam_channel as channel;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// The unit of work run for each task.
pub type Job<'a> = dyn Fn(FmqlQuery) -> Result<()> + Sync + 'a;

pub trait TaskRunner: Send + Sync + fmt::Debug {
    /// Runs `job` once per task and returns after every started task has finished.
    ///
    /// The first failing task wins: its error is returned and tasks not yet started are dropped.
    fn run(&self, tasks: Vec<FmqlQuery>, job: &Job<'_>) -> Result<()>;
}

/// A fixed number of OS threads draining a shared FIFO queue.
#[derive(Clone, Copy, Debug)]
pub struct ThreadedRunner {
    workers: usize,
}

impl ThreadedRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl TaskRunner for ThreadedRunner {
    fn run(&self, tasks: Vec<FmqlQuery>, job: &Job<'_>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let workers = self.workers.min(tasks.len());

        let (queue_tx, queue_rx) = channel::unbounded::<FmqlQuery>();
        for task in tasks {
            // The receiver is alive until the end of this function.
            let _ = queue_tx.send(task);
        }
        drop(queue_tx);

        let aborted = AtomicBool::new(false);
        let first_error: Mutex<Option<CacheError>> = Mutex::new(None);
        let record_error = |err: CacheError| {
            aborted.store(true, Ordering::SeqCst);
            first_error.lock().get_or_insert(err);
        };

        tracing::debug!(target = "vdm.cache", workers, "starting fetch workers");
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for idx in 0..workers {
                let queue_rx = &queue_rx;
                let aborted = &aborted;
                let record_error = &record_error;
                let spawned = thread::Builder::new()
                    .name(format!("vdm-fetch-{idx}"))
                    .spawn_scoped(scope, move || {
                        while let Ok(task) = queue_rx.recv() {
                            if aborted.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(err) = job(task) {
                                record_error(err);
                                break;
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        record_error(CacheError::transport(format!(
                            "failed to spawn fetch worker: {err}"
                        )));
                        break;
                    }
                }
            }

            for handle in handles {
                if handle.join().is_err() {
                    record_error(CacheError::transport("fetch worker panicked"));
                }
            }
        });

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Runs every task on the calling thread, in queue order or reversed.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineRunner {
    reversed: bool,
}

impl InlineRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the last-enqueued task first.
    pub fn reversed() -> Self {
        Self { reversed: true }
    }
}

impl TaskRunner for InlineRunner {
    fn run(&self, mut tasks: Vec<FmqlQuery>, job: &Job<'_>) -> Result<()> {
        if self.reversed {
            tasks.reverse();
        }
        tasks.into_iter().try_for_each(job)
    }
}
