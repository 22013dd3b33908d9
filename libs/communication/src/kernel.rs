//! Worker Thread Kernel
//!
//! A fixed set of named OS threads draining one work queue. Fan-out senders
//! use it to write to many peers in parallel.

use crate::{CommunicationError, Result, ThreadSafeQueue};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Work = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Work),
    Stop,
}

/// Fixed-size pool of worker threads
pub struct Kernel {
    queue: Arc<ThreadSafeQueue<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    thread_count: usize,
}

impl Kernel {
    /// Start `threads` worker threads
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(CommunicationError::configuration(
                "kernel needs at least one thread",
                Some("kernel.threads"),
            ));
        }

        let queue = Arc::new(ThreadSafeQueue::new("Kernel"));
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let name = format!("kernel-worker-{}", index);
            let worker_queue = Arc::clone(&queue);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker_queue));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    queue.shutdown();
                    return Err(CommunicationError::ThreadSpawn { name, source });
                }
            }
        }

        debug!(threads, "Kernel started");

        Ok(Self {
            queue,
            workers: Mutex::new(workers),
            accepting: AtomicBool::new(true),
            thread_count: threads,
        })
    }

    /// Queue a unit of work
    pub fn execute<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CommunicationError::shutdown("Kernel"));
        }
        self.queue.queue(Task::Run(Box::new(work)))
    }

    /// Stop accepting work, let queued work finish and join the workers.
    pub fn graceful_shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            for _ in 0..self.thread_count {
                if self.queue.queue(Task::Stop).is_err() {
                    break;
                }
            }
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Kernel worker exited abnormally");
            }
        }

        self.queue.shutdown();
        debug!("Kernel shut down gracefully");
    }

    /// Discard queued work and abandon the workers.
    ///
    /// Work already running is left to complete on its own.
    pub fn force_shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let discarded = self.queue.shutdown();
        // Dropping the handles detaches the threads.
        self.workers.lock().clear();
        if discarded > 0 {
            debug!(discarded, "Kernel force shut down, queued work discarded");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.force_shutdown();
    }
}

fn worker_loop(queue: Arc<ThreadSafeQueue<Task>>) {
    loop {
        match queue.dequeue(true) {
            Ok(Some(Task::Run(work))) => {
                if catch_unwind(AssertUnwindSafe(work)).is_err() {
                    error!(
                        thread = thread::current().name().unwrap_or("kernel-worker"),
                        "Kernel work panicked"
                    );
                }
            }
            Ok(Some(Task::Stop)) | Err(_) => return,
            Ok(None) => continue,
        }
    }
}
