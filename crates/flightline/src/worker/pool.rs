//! Fixed-size worker pool.
//!
//! Tasks flow through a rendezvous channel, so each worker holds exactly
//! one task at a time and a slow job cannot starve fairness by hoarding
//! prefetched work. All shared state lives in the persistent store; the
//! pool itself only moves tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::worker::executor::Executor;
use crate::worker::task::Task;

/// Cloneable handle for enqueueing tasks (the dispatcher holds one).
#[derive(Clone)]
pub struct TaskSender {
    sender: Sender<Task>,
    shutdown: Arc<AtomicBool>,
}

impl TaskSender {
    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        self.sender.send(task).map_err(|_| WorkerError::ChannelClosed)
    }
}

pub struct WorkerPool {
    task_sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(executor: Arc<Executor>, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");

        // Bounded queue; each worker receives one task at a time (no
        // prefetch), so a slow job cannot hoard work from idle workers.
        let (task_sender, task_receiver) = bounded::<Task>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = task_receiver.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_executor = Arc::clone(&executor);

            let handle = thread::spawn(move || {
                run_worker(worker_id, task_rx, shutdown_flag, worker_executor);
            });
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            task_sender,
            workers,
            shutdown,
        }
    }

    pub fn sender(&self) -> TaskSender {
        TaskSender {
            sender: self.task_sender.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        self.sender().submit(task)
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drops the sending side and joins all workers. Queued tasks drain
    /// first; call [`WorkerPool::shutdown`] beforehand to abandon them.
    pub fn wait(self) {
        drop(self.task_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    task_receiver: Receiver<Task>,
    shutdown: Arc<AtomicBool>,
    executor: Arc<Executor>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match task_receiver.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(task) => {
                debug!(
                    "Worker {} executing {} (job {})",
                    worker_id,
                    task.job_name(),
                    task.job_id()
                );
                // The executor converts every failure into a terminal job
                // status; nothing escapes to the worker loop.
                executor.execute(&task);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::ledger::{JobLink, JobState, JobStatus, Ledger};
    use crate::tools::fake::FakeToolRunner;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (Arc<Executor>, Database) {
        let config = Arc::new(Config::with_storage_root(tmp.path()));
        let db = Database::open_in_memory().unwrap();
        let executor = Arc::new(Executor::new(
            config,
            db.clone(),
            Arc::new(FakeToolRunner::new()),
        ));
        (executor, db)
    }

    #[test]
    fn test_pool_startup_and_shutdown() {
        let tmp = TempDir::new().unwrap();
        let (executor, _db) = setup(&tmp);
        let pool = WorkerPool::new(executor, 2);

        assert!(!pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.wait();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let tmp = TempDir::new().unwrap();
        let (executor, db) = setup(&tmp);
        let ledger = Ledger::new(db);
        let job = ledger.create("calculate-disk-usage", JobLink::None, None).unwrap();

        let pool = WorkerPool::new(executor, 1);
        let sender = pool.sender();
        pool.shutdown();

        let result = sender.submit(Task::CalculateDiskUsage { job_id: job.id });
        assert!(matches!(result, Err(WorkerError::ChannelClosed)));
        pool.wait();
    }

    #[test]
    fn test_pool_executes_maintenance_task() {
        let tmp = TempDir::new().unwrap();
        let (executor, db) = setup(&tmp);
        let ledger = Ledger::new(db);
        let job = ledger.create("calculate-disk-usage", JobLink::None, None).unwrap();

        let pool = WorkerPool::new(executor, 2);
        pool.submit(Task::CalculateDiskUsage {
            job_id: job.id.clone(),
        })
        .unwrap();
        pool.wait();

        let done = ledger.find(&job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.status, JobStatus::Success);
        assert!(done.extra.unwrap().get("total_bytes").is_some());
    }
}
