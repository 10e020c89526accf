//! Executors and completion handles.
//!
//! Persist, push and drop work runs on a single-threaded [`WorkerPool`] so
//! that disk changes happen in submission order; time-series folds run on a
//! separate multi-threaded pool. Callers observe background work through
//! one-shot [`Handle`]s.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::{Result, SinkbufError};

/// Unit of work accepted by the executors.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Creates a connected completer/handle pair.
pub(crate) fn handle<T>(task: &str) -> (Completer<T>, Handle<T>) {
    let (sender, receiver) = bounded(1);
    (
        Completer { sender },
        Handle {
            receiver,
            task: task.to_string(),
        },
    )
}

/// Sending half of a [`Handle`]. Dropping it without completing (for
/// example when the job panics) makes the handle report an aborted task.
pub(crate) struct Completer<T> {
    sender: Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        let _ = self.sender.send(result);
    }
}

/// Eventual result of a background operation.
pub struct Handle<T> {
    receiver: Receiver<Result<T>>,
    task: String,
}

impl<T> Handle<T> {
    /// Returns true once the result is available.
    pub fn is_complete(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Blocks until the operation finishes.
    pub fn wait(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(SinkbufError::TaskAborted { task: self.task }),
        }
    }

    /// Blocks for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(SinkbufError::ChannelTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(SinkbufError::TaskAborted { task: self.task })
            }
        }
    }
}

/// A pool of worker threads for concurrent task execution.
pub struct WorkerPool<T: Send + 'static> {
    name: String,
    workers: Mutex<Vec<Worker>>,
    sender: Sender<Message<T>>,
    shutdown: Arc<AtomicBool>,
    in_flight_tasks: Arc<AtomicUsize>,
    inline_handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

enum Message<T> {
    Task(T),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl WorkerPool<Job> {
    /// Creates a pool that runs boxed closures.
    pub fn for_jobs(name: &str, num_workers: usize, queue_capacity: usize) -> Self {
        Self::new(name, num_workers, queue_capacity, |job: Job| job())
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool of `num_workers` threads named `<name>-<id>` whose
    /// queue holds at most `queue_capacity` pending tasks.
    pub fn new<F>(name: &str, num_workers: usize, queue_capacity: usize, task_handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let num_workers = if num_workers == 0 {
            warn!("WorkerPool {} created with 0 workers; defaulting to 1", name);
            1
        } else {
            num_workers
        };

        let (sender, receiver) = bounded::<Message<T>>(queue_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight_tasks = Arc::new(AtomicUsize::new(0));
        let task_handler: Arc<dyn Fn(T) + Send + Sync> = Arc::new(task_handler);

        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight_tasks = Arc::clone(&in_flight_tasks);
            let task_handler = Arc::clone(&task_handler);
            let thread_name = format!("{}-{}", name, id);

            let thread_result = thread::Builder::new().name(thread_name.clone()).spawn(move || {
                debug!("Worker {} started", thread_name);

                loop {
                    let message = match receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(msg) => msg,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                            debug!("Worker {} channel disconnected", thread_name);
                            break;
                        }
                    };

                    match message {
                        Message::Task(task) => {
                            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                                || task_handler(task),
                            ));
                            in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                            if result.is_err() {
                                error!("Worker {} task panicked", thread_name);
                            }
                        }
                        Message::Shutdown => {
                            debug!("Worker {} received shutdown signal", thread_name);
                            break;
                        }
                    }
                }
            });

            match thread_result {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!("Failed to spawn worker thread {}-{}: {}", name, id, e);
                    break;
                }
            }
        }

        let inline_handler = if workers.is_empty() {
            warn!(
                "WorkerPool {} failed to spawn workers; tasks will execute inline on the caller thread",
                name
            );
            Some(task_handler)
        } else {
            None
        };

        Self {
            name: name.to_string(),
            workers: Mutex::new(workers),
            sender,
            shutdown,
            in_flight_tasks,
            inline_handler,
        }
    }

    /// Submits a task. Blocks while the queue is full.
    #[instrument(skip(self, task), fields(pool = %self.name))]
    pub fn submit(&self, task: T) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SinkbufError::Closed);
        }

        if let Some(handler) = &self.inline_handler {
            self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
            self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            if result.is_err() {
                return Err(SinkbufError::TaskAborted {
                    task: format!("{} inline task", self.name),
                });
            }
            return Ok(());
        }

        self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
        let message = match self.sender.try_send(Message::Task(task)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(message)) => message,
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                return Err(SinkbufError::ChannelSend {
                    channel: self.name.clone(),
                });
            }
        };

        warn!(
            "{} queue is full ({} tasks in flight); blocking until a slot frees up",
            self.name,
            self.active_tasks()
        );
        self.sender
            .send(message)
            .map_err(|_| SinkbufError::ChannelSend {
                channel: self.name.clone(),
            })
            .inspect_err(|_| {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            })?;

        Ok(())
    }

    /// Returns the number of in-flight tasks (queued or currently running).
    pub fn active_tasks(&self) -> usize {
        self.in_flight_tasks.load(Ordering::Acquire)
    }

    /// Waits, without a deadline, until no task is queued or running.
    pub fn wait_idle(&self) {
        while self.in_flight_tasks.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Runs every queued task, then stops and joins the workers. Later
    /// submissions fail with [`SinkbufError::Closed`]; a second call is a
    /// no-op.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool {}", self.name);

        // Queued tasks still run; only new submissions are refused.
        self.wait_idle();

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }

        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(_) => debug!("Worker {}-{} shut down", self.name, worker.id),
                    Err(_) => error!("Worker {}-{} panicked during shutdown", self.name, worker.id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::for_jobs("test-pool", 4, 8);

        for i in 1..=10 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(i, Ordering::AcqRel);
            }))
            .unwrap();
        }

        pool.wait_idle();
        assert_eq!(pool.active_tasks(), 0);
        assert_eq!(counter.load(Ordering::Acquire), 55);
        pool.shutdown();
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pool = WorkerPool::for_jobs("ordered", 1, 2);

        for i in 0..20 {
            let seen = Arc::clone(&seen);
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(1));
                seen.lock().push(i);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_queue_and_refuses_new_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::for_jobs("closed", 1, 4);
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                ran.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(ran.load(Ordering::Acquire), 3);
        assert!(pool.workers.lock().iter().all(|w| w.thread.is_none()));
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(SinkbufError::Closed)
        ));
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_aborts_its_handle() {
        let pool = WorkerPool::for_jobs("panicky", 1, 1);
        let (completer, handle) = handle::<u32>("explode");
        pool.submit(Box::new(move || {
            let _completer = completer;
            panic!("boom");
        }))
        .unwrap();

        assert!(matches!(
            handle.wait(),
            Err(SinkbufError::TaskAborted { task }) if task == "explode"
        ));
        pool.shutdown();
    }

    #[test]
    fn test_handle_timeout_and_completion() {
        let (_completer, pending) = handle::<u32>("slow");
        assert!(!pending.is_complete());
        assert!(matches!(
            pending.wait_timeout(Duration::from_millis(10)),
            Err(SinkbufError::ChannelTimeout { .. })
        ));

        let (completer, done) = handle::<u32>("fast");
        completer.complete(Ok(7));
        assert!(done.is_complete());
        assert_eq!(done.wait().unwrap(), 7);
    }
}
