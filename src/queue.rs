//! Per-address serialization of session mutations.
//!
//! Every operation that mutates a `SessionRecord` runs as a job on the
//! queue for its remote address. Jobs for the same address run strictly in
//! submission order; jobs for different addresses are independent. A failed
//! job releases the queue like any other.

use crate::address::ProtocolAddress;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// FIFO job queues keyed by remote address.
///
/// One instance is shared by every cipher and builder that targets the same
/// storage, typically one per application.
#[derive(Default)]
pub struct JobQueue {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobQueue {
    /// Create an empty queue registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` once every previously queued job for `address` has
    /// completed. The job's output (success or failure) is returned as-is.
    pub async fn run<T, F>(&self, address: &ProtocolAddress, job: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(address.to_string()).or_default().clone()
        };
        // tokio mutexes hand the lock to waiters in FIFO order
        let _serialized = lock.lock().await;
        job.await
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}
