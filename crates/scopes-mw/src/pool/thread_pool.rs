//! Fixed-size worker pool
//!
//! Jobs go through one unbounded queue that all workers share. With a
//! single worker the queue is drained strictly in submission order; with
//! more workers jobs start in order but may finish in any order.
//!
//! Dropping the pool closes the queue, lets the workers run every job that
//! was already submitted, and joins them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::types::{MwError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the result of a submitted task
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task has run and return its result.
    pub fn get(self) -> Result<R> {
        self.rx
            .blocking_recv()
            .map_err(|_| MwError::Middleware("task was abandoned before producing a result".to_string()))
    }
}

/// Worker pool with a fixed number of OS threads
pub struct ThreadPool {
    name: String,
    sender: Option<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(MwError::InvalidArgument(format!(
                "thread pool {}: size must be at least 1",
                name
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(rx))
                .map_err(|e| MwError::Resource(format!("cannot start thread pool {}: {}", name, e)))?;
            workers.push(handle);
        }
        debug!("Started thread pool {} with {} worker(s)", name, size);

        Ok(Self {
            name,
            sender: Some(tx),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task and return a handle to its result.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            // The caller may have dropped the handle.
            let _ = tx.send(task());
        })?;
        Ok(TaskHandle { rx })
    }

    /// Queue a task whose result nobody waits for.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| MwError::Middleware(format!("thread pool {} is shut down", self.name)))?;
        sender
            .send(Box::new(task))
            .map_err(|_| MwError::Middleware(format!("thread pool {} is shut down", self.name)))
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = rx.lock().blocking_recv();
        let Some(job) = job else { break };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                "Task panicked on worker {}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // A task that drops its own pool cannot wait for itself.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
        debug!("Thread pool {} stopped", self.name);
    }
}
