use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use strum_macros::Display;
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Terminal state reported by a transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkerStatus {
    Normal,
    Error,
    Canceled,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Fixed size pool of transfer threads. `execute` hands the job over a
/// rendezvous channel, so it blocks until one worker is idle: a saturated
/// pool slows the submitter down instead of queuing more work.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(0);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("vcsync-worker-{}", index))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job()
                    }
                })
                .context(format!("Spawn worker thread {}", index))?;
            workers.push(worker);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute(&self, job: Job) -> Result<(), PoolError> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|_| PoolError::ShutDown),
            None => Err(PoolError::ShutDown),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("A worker thread panicked");
            }
        }
    }
}

type TaskResult = Result<WorkerStatus>;

/// Tracks the tasks one caller submitted to a shared [`WorkerPool`] so it
/// can later wait for exactly those, whatever other callers are doing.
pub struct CompletionService {
    pool: Arc<WorkerPool>,
    results_sender: Sender<TaskResult>,
    results_receiver: Receiver<TaskResult>,
    outstanding: usize,
}

impl CompletionService {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        let (results_sender, results_receiver) = unbounded();
        Self {
            pool,
            results_sender,
            results_receiver,
            outstanding: 0,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Blocks while the pool is saturated
    pub fn submit<F>(&mut self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let results_sender = self.results_sender.clone();
        self.pool.execute(Box::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(_) => Err(anyhow!("Transfer task panicked")),
            };
            if results_sender.send(result).is_err() {
                log::error!("Task result receiver is gone");
            }
        }))?;
        self.outstanding += 1;
        Ok(())
    }

    /// Wait for every task submitted so far. Each outcome is given to
    /// `on_result` or, when the task failed, to `on_error`.
    pub fn wait_for_completions<R, E>(&mut self, mut on_result: R, mut on_error: E)
    where
        R: FnMut(WorkerStatus),
        E: FnMut(anyhow::Error),
    {
        while self.outstanding > 0 {
            match self.results_receiver.recv() {
                Ok(Ok(status)) => on_result(status),
                Ok(Err(error)) => on_error(error),
                // Unreachable while we hold a sender clone
                Err(_) => break,
            }
            self.outstanding -= 1;
        }
    }
}

impl Drop for CompletionService {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            log::warn!(
                "Completion service dropped with {} outstanding tasks, wait for them",
                self.outstanding
            );
            self.wait_for_completions(|_| {}, |_| {});
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    #[test]
    fn test_wait_for_exactly_submitted_tasks() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let mut completions = CompletionService::new(pool);
        let done = Arc::new(AtomicUsize::new(0));

        for index in 0..5 {
            let done = done.clone();
            completions
                .submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                    match index {
                        3 => Err(anyhow!("boom")),
                        4 => Ok(WorkerStatus::Canceled),
                        _ => Ok(WorkerStatus::Normal),
                    }
                })
                .unwrap();
        }

        let mut statuses = vec![];
        let mut errors = vec![];
        completions.wait_for_completions(
            |status| statuses.push(status),
            |error| errors.push(format!("{}", error)),
        );

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(completions.outstanding(), 0);
        assert_eq!(statuses.len(), 4);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == WorkerStatus::Canceled)
                .count(),
            1
        );
        assert_eq!(errors, vec!["boom".to_string()]);
    }

    #[test]
    fn test_panicking_task_is_accounted_as_error() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut completions = CompletionService::new(pool);
        completions.submit(|| panic!("unexpected")).unwrap();

        let mut errors = 0;
        completions.wait_for_completions(|_| {}, |_| errors += 1);
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_submit_blocks_while_saturated() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut completions = CompletionService::new(pool);
        let (release_sender, release_receiver) = bounded::<()>(0);

        completions
            .submit(move || {
                release_receiver.recv().unwrap();
                Ok(WorkerStatus::Normal)
            })
            .unwrap();

        // The only worker is busy, the second submit can only return once released
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_sender.send(()).unwrap();
        });
        let started = Instant::now();
        completions.submit(|| Ok(WorkerStatus::Normal)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));

        let mut count = 0;
        completions.wait_for_completions(|_| count += 1, |_| {});
        assert_eq!(count, 2);
        releaser.join().unwrap();
    }
}
