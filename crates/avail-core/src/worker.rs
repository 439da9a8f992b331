//! Single-consumer worker thread with a priority and a regular queue.
//!
//! Slow or external calls (disabling the peer over a management API,
//! writing marker files) are handed to the worker so the engine task never
//! blocks on them. The priority queue is always drained first; each queue
//! is FCFS and an action runs to completion once started.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::error::{AvailError, AvailResult};

pub type WorkerAction = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queues {
    priority: VecDeque<WorkerAction>,
    regular: VecDeque<WorkerAction>,
}

impl Queues {
    fn next(&mut self) -> Option<WorkerAction> {
        self.priority.pop_front().or_else(|| self.regular.pop_front())
    }
}

struct Shared {
    queues: Mutex<Queues>,
    ready: Condvar,
    stop: AtomicBool,
}

pub struct WorkerThread {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn the consumer thread. Failure to spawn is process-fatal for
    /// the caller.
    pub fn spawn(name: impl Into<String>) -> AvailResult<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let consumer = shared.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&thread_name, &consumer))
            .map_err(|e| AvailError::failed(format!("failed to spawn worker {name}: {e}")))?;

        info!(worker = %name, "worker thread started");
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    pub fn enqueue(&self, action: impl FnOnce() + Send + 'static) -> AvailResult<()> {
        self.push(Box::new(action), false)
    }

    pub fn enqueue_priority(&self, action: impl FnOnce() + Send + 'static) -> AvailResult<()> {
        self.push(Box::new(action), true)
    }

    fn push(&self, action: WorkerAction, priority: bool) -> AvailResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(AvailError::failed(format!("worker {} is stopped", self.name)));
        }
        let mut queues = self
            .shared
            .queues
            .lock()
            .map_err(|_| AvailError::failed(format!("worker {} queue poisoned", self.name)))?;
        if priority {
            queues.priority.push_back(action);
        } else {
            queues.regular.push_back(action);
        }
        drop(queues);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Queued (priority, regular) action counts.
    pub fn pending(&self) -> (usize, usize) {
        match self.shared.queues.lock() {
            Ok(q) => (q.priority.len(), q.regular.len()),
            Err(_) => (0, 0),
        }
    }

    /// Stop the consumer and join it. Actions still queued are dropped.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ready.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
            info!(worker = %self.name, "worker thread stopped");
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(name: &str, shared: &Shared) {
    loop {
        let action = {
            let Ok(mut queues) = shared.queues.lock() else {
                error!(worker = %name, "worker queue poisoned, exiting");
                return;
            };
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    debug!(worker = %name, "worker stop requested");
                    return;
                }
                if let Some(action) = queues.next() {
                    break action;
                }
                queues = match shared.ready.wait(queues) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };
        action();
    }
}
