//! Fixed-pool task executor.
//!
//! A fixed number of worker threads consume an MPMC ring of task-record
//! addresses. Idle workers park on a condition variable; any successful
//! submission signals it. Shutdown is cooperative: once the signal latch
//! is raised, each worker finishes draining, increments the participant
//! counter, and exits.
//!
//! No fairness, no ordering, no worker affinity: tasks must not assume
//! any of them.

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::thread;

use crate::ring::MpmcRing;
use crate::signal::Signal;

pub(crate) mod task;
use task::TaskRecord;

mod worker;

/// Submission failures surfaced synchronously to the caller.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The task queue is full. The record was reclaimed; the caller may
    /// retry.
    #[error("task queue is full")]
    Overflow,

    /// Shutdown is latched; the executor only drains from here on.
    #[error("shutdown latched, executor is draining")]
    Draining,
}

/// Configures and spawns an [`Executor`].
pub struct Builder {
    worker_threads: Option<usize>,
    thread_name: String,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: "spate-worker".to_string(),
        }
    }

    /// Sets the number of worker threads. Defaults to the number of
    /// online logical CPUs.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name prefix for spawned workers; thread `i` is named
    /// `"{prefix}-{i}"`.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Spawn the workers and return the shared executor handle.
    pub fn build<const N: usize>(self, signal: Signal) -> Result<Arc<Executor<N>>> {
        let workers = match self.worker_threads {
            Some(w) => w,
            None => thread::available_parallelism()?.get(),
        };

        let executor = Arc::new(Executor {
            queue: MpmcRing::new(),
            workers,
            pending: AtomicUsize::new(0),
            park: Mutex::new(()),
            unpark: Condvar::new(),
            signal,
            live_records: AtomicIsize::new(0),
        });

        // Workers are detached: shutdown rendezvous goes through the
        // participant counter, not join handles.
        for i in 0..workers {
            let handle = Arc::clone(&executor);
            thread::Builder::new()
                .name(format!("{}-{}", self.thread_name, i))
                .spawn(move || worker::run(handle))?;
        }

        Ok(executor)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed pool of workers behind a bounded MPMC task queue.
///
/// `N` is the queue capacity and must be a power of two.
pub struct Executor<const N: usize> {
    queue: MpmcRing<N>,

    workers: usize,

    /// Advisory gauge of queued-but-unclaimed tasks; drives parking
    /// decisions only, the queue slots stay authoritative.
    pending: AtomicUsize,

    /// Mutex + condvar used exclusively for idle parking. No data lives
    /// under the lock.
    park: Mutex<()>,
    unpark: Condvar,

    signal: Signal,

    /// Debug ledger of live task records; asserted empty at teardown.
    live_records: AtomicIsize,
}

impl<const N: usize> Executor<N> {
    /// Schedule pure CPU work.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.enqueue(TaskRecord::cpu(f))
    }

    /// Schedule the continuation of an I/O completion, carrying its
    /// integer result.
    pub fn submit_completion(
        &self,
        result: i32,
        f: impl FnOnce(i32) + Send + 'static,
    ) -> Result<(), SubmitError> {
        self.enqueue(TaskRecord::completion(result, f))
    }

    fn enqueue(&self, record: Box<TaskRecord>) -> Result<(), SubmitError> {
        if self.signal.raised().is_some() {
            return Err(SubmitError::Draining);
        }

        self.ledger_alloc();
        let addr = Box::into_raw(record) as usize;

        match self.queue.push(addr) {
            Some(_slot) => {
                self.pending.fetch_add(1, Ordering::Release);

                // Taking the parking lock closes the race against a worker
                // that observed an empty gauge but has not started waiting
                // yet.
                let _guard = self.park.lock();
                self.unpark.notify_one();
                Ok(())
            }
            None => {
                // Safety: the push failed, so the address was never
                // published and we still own the record.
                drop(unsafe { Box::from_raw(addr as *mut TaskRecord) });
                self.ledger_free();
                Err(SubmitError::Overflow)
            }
        }
    }

    /// Pop and run records until the queue is observed empty.
    pub(crate) fn drain(&self) {
        while let Some((_slot, addr)) = self.queue.pop() {
            self.pending.fetch_sub(1, Ordering::Release);

            // Safety: a successful pop transfers sole ownership of the
            // record address to this worker.
            let record = unsafe { Box::from_raw(addr as *mut TaskRecord) };
            record.run();
            self.ledger_free();
        }
    }

    pub(crate) fn park_until_work(&self) {
        let mut guard = self.park.lock();

        // Re-check under the lock: a racing submit has either bumped the
        // gauge already or is blocked on the lock until we wait.
        if self.pending.load(Ordering::Acquire) == 0 && self.signal.raised().is_none() {
            self.unpark.wait(&mut guard);
        }
    }

    /// Broadcast the parking condvar; used by shutdown to release every
    /// parked worker.
    pub(crate) fn release_parked(&self) {
        let _guard = self.park.lock();
        self.unpark.notify_all();
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub(crate) fn signal(&self) -> &Signal {
        &self.signal
    }

    fn ledger_alloc(&self) {
        if cfg!(debug_assertions) {
            self.live_records.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ledger_free(&self) {
        if cfg!(debug_assertions) {
            self.live_records.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl<const N: usize> Drop for Executor<N> {
    fn drop(&mut self) {
        // Tasks that raced the shutdown latch into the queue are never
        // claimed by a worker; reclaim them here.
        while let Some((_slot, addr)) = self.queue.pop() {
            drop(unsafe { Box::from_raw(addr as *mut TaskRecord) });
            self.ledger_free();
        }

        debug_assert_eq!(
            self.live_records.load(Ordering::Relaxed),
            0,
            "task records leaked"
        );
    }
}
