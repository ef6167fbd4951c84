use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::model::{Job, JobFilter, JobSpec, JobStatus, ResultMetadata};
use super::store::{JobStore, JobSubscription, StoreResult};
use crate::error::{ErrorDetail, ErrorKind, StoreError};

/// In-process job store.
///
/// All mutations happen under one mutex, which makes `claim_next` atomic
/// across every task sharing the store.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    changes: broadcast::Sender<Job>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            jobs: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Insert a job record as-is. Useful for seeding tests and local renders.
    pub fn insert(&self, job: Job) {
        self.jobs().insert(job.id.clone(), job);
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, job: &Job) {
        // No receivers is fine.
        let _ = self.changes.send(job.clone());
    }

    /// Apply `f` to job `id` after checking that `to` is a legal next status.
    fn transition(
        &self,
        id: &str,
        to: JobStatus,
        f: impl FnOnce(&mut Job),
    ) -> StoreResult<Job> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to,
            });
        }
        job.status = to;
        f(job);
        let snapshot = job.clone();
        drop(jobs);
        self.publish(&snapshot);
        Ok(snapshot)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn submit(&self, spec: JobSpec) -> StoreResult<Job> {
        let job = Job::new(spec);
        self.jobs().insert(job.id.clone(), job.clone());
        self.publish(&job);
        Ok(job)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        Ok(self.jobs().get(id).cloned())
    }

    async fn claim_next(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let mut jobs = self.jobs();
        let next_id = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id.clone());
        let Some(id) = next_id else {
            return Ok(None);
        };
        let now = Utc::now();
        let snapshot = match jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Processing;
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                job.started_at = Some(now);
                job.clone()
            }
            None => return Ok(None),
        };
        drop(jobs);
        debug!(job_id = %id, worker_id, "claimed job");
        self.publish(&snapshot);
        Ok(Some(snapshot))
    }

    async fn report_progress(&self, id: &str, progress: u8, message: &str) -> StoreResult<()> {
        let snapshot = {
            let mut jobs = self.jobs();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if job.status != JobStatus::Processing {
                return Ok(());
            }
            job.progress = job.progress.max(progress.min(100));
            job.progress_message = Some(message.to_string());
            job.clone()
        };
        self.publish(&snapshot);
        Ok(())
    }

    async fn complete(&self, id: &str, metadata: &ResultMetadata) -> StoreResult<()> {
        self.transition(id, JobStatus::Completed, |job| {
            job.progress = 100;
            job.progress_message = Some("Completed".into());
            job.completed_at = Some(Utc::now());
            job.locked_by = None;
            job.locked_at = None;
            job.metadata = Some(metadata.clone());
        })?;
        Ok(())
    }

    async fn fail(&self, id: &str, message: &str, detail: &ErrorDetail) -> StoreResult<()> {
        let to = if detail.kind == ErrorKind::Cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        self.transition(id, to, |job| {
            job.completed_at = Some(Utc::now());
            job.locked_by = None;
            job.locked_at = None;
            job.error_message = Some(message.to_string());
            job.error_details = Some(detail.clone());
        })?;
        Ok(())
    }

    async fn cancel(&self, id: &str, owner_id: &str) -> StoreResult<bool> {
        {
            let jobs = self.jobs();
            match jobs.get(id) {
                Some(job) if job.owner_id == owner_id && job.status == JobStatus::Pending => {}
                Some(_) => return Ok(false),
                None => return Err(StoreError::NotFound(id.to_string())),
            }
        }
        match self.transition(id, JobStatus::Cancelled, |job| {
            job.completed_at = Some(Utc::now());
        }) {
            Ok(_) => Ok(true),
            // Claimed between the check and the transition.
            Err(StoreError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, owner_id: &str, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut out: Vec<Job> = self
            .jobs()
            .values()
            .filter(|j| j.owner_id == owner_id)
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| {
                filter
                    .project_id
                    .as_ref()
                    .is_none_or(|p| j.project_id.as_ref() == Some(p))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn subscribe(&self, id: &str) -> StoreResult<JobSubscription> {
        let mut changes = self.changes.subscribe();
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (tx, rx) = mpsc::channel(32);
        let id = id.to_string();
        let feeder = tokio::spawn(async move {
            if current.status.is_terminal() {
                let _ = tx.send(current).await;
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(job) if job.id == id => {
                        let terminal = job.status.is_terminal();
                        if tx.send(job).await.is_err() || terminal {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(JobSubscription::new(rx, feeder))
    }

    async fn cleanup_stale(&self, lock_timeout: Duration) -> StoreResult<usize> {
        let timeout =
            chrono::Duration::from_std(lock_timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - timeout;
        let stale: Vec<String> = self
            .jobs()
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .filter(|j| j.locked_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id.clone())
            .collect();
        let detail = ErrorDetail {
            kind: ErrorKind::Internal,
            stage: None,
            message: "worker lock expired".into(),
        };
        let mut released = 0;
        for id in stale {
            if self.fail(&id, "worker lock expired", &detail).await.is_ok() {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
