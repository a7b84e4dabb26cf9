// src/pool.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over a FIFO task queue.
///
/// Workers sleep on a condvar, pop one task at a time and run it with the
/// queue unlocked. Shutdown lets the queue drain before the workers exit.
pub struct ThreadPool {
    size: usize,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar,
    stop: AtomicBool,
}

impl ThreadPool {
    /// Spawn exactly `size` worker threads.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool needs at least one thread");
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("presto-worker-{id}"))
                .spawn(move || worker_loop(id, &shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            size,
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Append a task and wake one waiter. After `shutdown` the task is
    /// silently dropped.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
            if self.shared.stop.load(Ordering::Acquire) {
                return;
            }
            queue.push_back(Box::new(task));
        }
        self.shared.ready.notify_one();
    }

    /// Signal workers to exit once the queue is empty, then join them.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            // the flag flips under the queue lock so no worker misses the wakeup
            let _queue = self.shared.queue.lock().expect("pool queue poisoned");
            self.shared.stop.store(true, Ordering::Release);
        }
        self.shared.ready.notify_all();

        let handles: Vec<_> = {
            let mut handles = self.handles.lock().expect("pool handles poisoned");
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.ready.wait(queue).expect("pool queue poisoned");
            }
        };

        // runs with the queue unlocked; a panicking task must not take the
        // worker down with it
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(worker = id, "task panicked");
        }
    }
}
