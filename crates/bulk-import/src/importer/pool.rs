//! Fixed-size worker pool with in-flight accounting.
//!
//! Jobs are counted as in flight from the moment they're submitted until
//! they finish or are discarded, so `in_flight() == 0 && queued() == 0`
//! means no work exists anywhere in the pool.

use crate::{ImportError, Result};
use crossbeam_channel as chan;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Releases one in-flight count when dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A pool of named OS threads consuming an unbounded job queue.
pub struct WorkerPool {
    sender: Mutex<Option<chan::Sender<Job>>>,
    receiver: chan::Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    terminated: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one) named `<name_prefix><n>`.
    pub fn new(threads: usize, name_prefix: &str) -> Result<Self> {
        let (tx, rx) = chan::unbounded::<Job>();
        let terminated = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads.max(1));
        for wid in 0..threads.max(1) {
            let rx = rx.clone();
            let terminated = Arc::clone(&terminated);
            let handle = thread::Builder::new()
                .name(format!("{}{}", name_prefix, wid))
                .spawn(move || worker_loop(rx, terminated))
                .map_err(ImportError::from)?;
            workers.push(handle);
        }
        debug!("Started worker pool with {} threads", workers.len());

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            receiver: rx,
            workers: Mutex::new(workers),
            in_flight: Arc::new(AtomicUsize::new(0)),
            terminated,
        })
    }

    /// Queue a job.
    ///
    /// Fails with [`ImportError::Interrupted`] once the pool has been shut
    /// down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ImportError::Interrupted);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let job: Job = Box::new(move || {
            let _guard = guard;
            job();
        });

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            // a rejected job is dropped here, releasing its count
            Some(tx) => tx.send(job).map_err(|_| ImportError::Interrupted),
            None => Err(ImportError::Interrupted),
        }
    }

    /// Jobs submitted and not yet finished or discarded, including queued ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_quiescent(&self) -> bool {
        self.in_flight() == 0 && self.queued() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Stop accepting jobs and discard the queue. Running jobs finish on
    /// their own. Returns how many jobs were discarded.
    pub fn shutdown_now(&self) -> usize {
        self.terminated.store(true, Ordering::SeqCst);
        self.shutdown();
        let discarded = self.receiver.try_iter().count();
        if discarded > 0 {
            debug!("Discarded {} queued jobs", discarded);
        }
        discarded
    }

    /// Wait for every worker thread to exit. Call after a shutdown.
    ///
    /// A worker calling this skips joining itself.
    pub fn join(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread panicked outside a job");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn worker_loop(rx: chan::Receiver<Job>, terminated: Arc<AtomicBool>) {
    while let Ok(job) = rx.recv() {
        if terminated.load(Ordering::SeqCst) {
            drop(job);
            continue;
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                "Job panicked on {}",
                thread::current().name().unwrap_or("worker")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_and_release_count() {
        let pool = WorkerPool::new(2, "test-worker-").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap()).unwrap();
        }
        let mut seen: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        pool.shutdown();
        pool.join();
        assert!(pool.is_quiescent());
    }

    #[test]
    fn test_shutdown_now_discards_queue() {
        let pool = WorkerPool::new(1, "test-worker-").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        for _ in 0..5 {
            pool.submit(|| {}).unwrap();
        }
        assert_eq!(pool.in_flight(), 6);

        assert_eq!(pool.shutdown_now(), 5);
        assert_eq!(pool.in_flight(), 1);
        assert!(matches!(pool.submit(|| {}), Err(ImportError::Interrupted)));

        release_tx.send(()).unwrap();
        pool.join();
        assert!(pool.is_quiescent());
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = WorkerPool::new(1, "test-worker-").unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.shutdown();
        pool.join();
        assert_eq!(pool.in_flight(), 0);
    }
}
