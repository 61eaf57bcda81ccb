//! Background worker pool.
//!
//! Runs blocking jobs (disk allocation, hashing, outgoing TCP connects) on
//! a small set of threads. Jobs post their results back into the main loop
//! through whatever channel they captured; the pool itself knows nothing
//! about result types.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads executing boxed jobs in FIFO order.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let threads = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            threads,
        }
    }

    /// Queues a job. Jobs run in submission order per worker.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            // send only fails when all workers are gone, i.e. at shutdown
            let _ = tx.send(Box::new(job));
        }
    }

    /// Returns a handle that can queue jobs from other owners.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.tx.clone().expect("pool is live"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel lets the workers drain and exit
        self.tx.take();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// Cloneable job-submission handle to a [`WorkerPool`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<Job>,
}

impl WorkerHandle {
    /// Queues a job on the pool this handle belongs to.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn jobs_run_and_post_results() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            pool.submit(move || {
                let _ = tx.send(i * 2);
            });
        }
        drop(tx);
        let mut results: Vec<i32> = rx.iter().collect();
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn handle_submits_after_pool_moves() {
        let pool = WorkerPool::new(1);
        let handle = pool.handle();
        let (tx, rx) = unbounded();
        handle.submit(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn drop_waits_for_queued_jobs() {
        let (tx, rx) = unbounded();
        {
            let pool = WorkerPool::new(1);
            for _ in 0..4 {
                let tx = tx.clone();
                pool.submit(move || {
                    let _ = tx.send(());
                });
            }
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 4);
    }
}
