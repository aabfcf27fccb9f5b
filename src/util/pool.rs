//! Fixed-size worker pool.
//!
//! Backs both the parallel log writers and the applier lanes. Jobs are
//! dispatched over a crossbeam channel; `wait_for_idle` blocks until every
//! scheduled job has finished, which is the barrier the apply pipeline
//! leans on between phases.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    outstanding: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    idle: Condvar,
}

pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState { outstanding: 0 }),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                        let mut state = shared.state.lock().expect("pool state poisoned");
                        state.outstanding -= 1;
                        if state.outstanding == 0 {
                            shared.idle.notify_all();
                        }
                    }
                })
                .expect("spawn pool worker");
            workers.push(handle);
        }

        Self {
            shared,
            tx: Some(tx),
            workers,
            threads,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock().expect("pool state poisoned");
            state.outstanding += 1;
        }
        self.tx
            .as_ref()
            .expect("pool sender present until drop")
            .send(Box::new(job))
            .expect("pool workers outlive senders");
    }

    /// Block until every job scheduled so far has completed.
    pub fn wait_for_idle(&self) {
        let mut state = self.shared.state.lock().expect("pool state poisoned");
        while state.outstanding > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .expect("pool state poisoned");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel stops the workers once the queue drains.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_jobs_before_idle_returns() {
        let pool = ThreadPool::new("test-pool", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_for_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn idle_on_empty_pool_returns_immediately() {
        let pool = ThreadPool::new("test-pool", 2);
        pool.wait_for_idle();
    }

    #[test]
    fn drop_joins_workers() {
        let pool = ThreadPool::new("test-pool", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
