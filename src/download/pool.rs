// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fixed-size thread pool for file transfers.
//!
//! Each submitted job gets a [`JobHandle`] the coordinator can poll or wait
//! on with a deadline. A panicking job is caught and reported through its
//! handle; it does not take the pool thread down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::locks::resilient_lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of waiting on a job.
#[derive(Debug, PartialEq, Eq)]
pub enum JobWait<T> {
    Finished(T),
    /// The job panicked; the message is the panic payload when it was a string.
    Panicked(String),
    TimedOut,
}

/// Handle to one submitted job.
pub struct JobHandle<T> {
    rx: Receiver<thread::Result<T>>,
    result: Option<JobWait<T>>,
}

impl<T> JobHandle<T> {
    /// Non-blocking check. Returns true once the job has returned.
    pub fn is_finished(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.result = Some(into_wait(result));
                true
            }
            Err(TryRecvError::Empty) => false,
            // Sender dropped without a result: the pool was torn down.
            Err(TryRecvError::Disconnected) => {
                self.result = Some(JobWait::Panicked("worker pool shut down".to_string()));
                true
            }
        }
    }

    /// Block until the job returns or `timeout` elapses.
    pub fn wait_timeout(mut self, timeout: Duration) -> JobWait<T> {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => into_wait(result),
            Err(RecvTimeoutError::Timeout) => JobWait::TimedOut,
            Err(RecvTimeoutError::Disconnected) => JobWait::Panicked("worker pool shut down".to_string()),
        }
    }
}

fn into_wait<T>(result: thread::Result<T>) -> JobWait<T> {
    match result {
        Ok(value) => JobWait::Finished(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            JobWait::Panicked(message)
        }
    }
}

/// Bounded pool of OS threads pulling jobs from a shared queue.
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut threads = Vec::with_capacity(size.max(1));

        for i in 0..size.max(1) {
            let job_rx = Arc::clone(&job_rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    // Hold the queue lock only while receiving.
                    let job = resilient_lock(&job_rx).recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            threads.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue a job. Jobs start in submission order.
    pub fn submit<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });
        if let Some(job_tx) = &self.job_tx {
            // A send failure drops the job and its result sender, which the
            // handle reports as a shut-down pool.
            let _ = job_tx.send(job);
        }
        JobHandle { rx, result: None }
    }

    /// Stop accepting jobs and join every thread once the queue drains.
    pub fn join(mut self) {
        self.job_tx.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Download worker thread panicked outside a job");
            }
        }
    }
}

impl Drop for WorkerPool {
    /// Dropping without `join` detaches the threads; they exit after the
    /// queue drains. Used when a job is stuck past its cancellation deadline.
    fn drop(&mut self) {
        self.job_tx.take();
    }
}
