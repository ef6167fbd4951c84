//! The durable job queue contract.
//!
//! A [`JobStore`] is the only way the worker sees jobs. `claim_next` is the
//! mutual-exclusion point between workers: it must flip a pending job to
//! processing and stamp the lock owner in one atomic step, so two workers
//! polling the same store never receive the same job.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::model::{Job, JobFilter, JobSpec, ResultMetadata};
use crate::error::{ErrorDetail, StoreError};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn submit(&self, spec: JobSpec) -> StoreResult<Job>;

    async fn get(&self, id: &str) -> StoreResult<Option<Job>>;

    /// Atomically claim the next pending job for `worker_id`.
    async fn claim_next(&self, worker_id: &str) -> StoreResult<Option<Job>>;

    async fn report_progress(&self, id: &str, progress: u8, message: &str) -> StoreResult<()>;

    async fn complete(&self, id: &str, metadata: &ResultMetadata) -> StoreResult<()>;

    async fn fail(&self, id: &str, message: &str, detail: &ErrorDetail) -> StoreResult<()>;

    /// Cancel a job on behalf of its owner. Succeeds only while pending.
    async fn cancel(&self, id: &str, owner_id: &str) -> StoreResult<bool>;

    async fn list(&self, owner_id: &str, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Watch a job for changes. Dropping the subscription unsubscribes.
    async fn subscribe(&self, id: &str) -> StoreResult<JobSubscription>;

    /// Fail processing jobs whose lock is older than `lock_timeout`.
    ///
    /// Returns how many jobs were released.
    async fn cleanup_stale(&self, lock_timeout: Duration) -> StoreResult<usize>;

    /// Cheap reachability probe used by the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Handle returned by [`JobStore::subscribe`].
///
/// Yields job snapshots as they change; the feeding task stops when the
/// handle is dropped or [`unsubscribe`](Self::unsubscribe) is called.
#[derive(Debug)]
pub struct JobSubscription {
    rx: mpsc::Receiver<Job>,
    feeder: JoinHandle<()>,
}

impl JobSubscription {
    pub fn new(rx: mpsc::Receiver<Job>, feeder: JoinHandle<()>) -> Self {
        Self { rx, feeder }
    }

    /// Next change, or `None` once the job has reached a terminal state.
    pub async fn next(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}
