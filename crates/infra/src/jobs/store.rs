//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus, QueueName};

/// Job store abstraction.
///
/// Completed jobs are removed; dead-lettered jobs move to a separate set
/// where operators can inspect, retry or delete them.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest claimable job of `queue` and mark it running.
    ///
    /// The claim expires after `claim_timeout`; an expired claim is handed
    /// out again.
    async fn claim_next(
        &self,
        queue: QueueName,
        claim_timeout: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Remove a successfully processed job.
    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    async fn list_dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead letter back to pending with a fresh attempt budget.
    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job payload: {0}")]
    Payload(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-queue job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        claim_timeout: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        // FIFO by creation time
        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(claim_timeout);
                job.clone()
            })
        }))
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn complete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut dls = self
            .dead_letters
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !job.status.is_terminal() {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.claim_expires_at = None;
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self
            .dead_letters
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job.queue == queue)
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut dls = self
            .dead_letters
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let job = reset_for_retry(entry.job);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut dls = self
            .dead_letters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        dls.remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let dls = self
            .dead_letters
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying { .. } => stats.retrying += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.values().filter(|e| e.job.queue == queue).count();
        Ok(stats)
    }
}

/// Reset a dead-lettered job so it runs again from a clean attempt count.
pub(crate) fn reset_for_retry(mut job: Job) -> Job {
    job.status = JobStatus::Pending;
    job.attempt = 0;
    job.scheduled_at = None;
    job.claim_expires_at = None;
    job.updated_at = Utc::now();
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;

    const CLAIM: Duration = Duration::from_secs(30);

    fn job(queue: QueueName) -> Job {
        Job::new(queue, serde_json::json!({"n": 1}))
    }

    #[tokio::test]
    async fn claims_are_fifo_and_queue_scoped() {
        let store = InMemoryJobStore::new();
        let first = job(QueueName::Finalize);
        let mut second = job(QueueName::Finalize);
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        let other = job(QueueName::BulkNotify);

        store.enqueue(second.clone()).await.unwrap();
        store.enqueue(other.clone()).await.unwrap();
        store.enqueue(first.clone()).await.unwrap();

        let claimed = store.claim_next(QueueName::Finalize, CLAIM).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        let claimed = store.claim_next(QueueName::Finalize, CLAIM).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next(QueueName::Finalize, CLAIM).await.unwrap().is_none());

        let claimed = store.claim_next(QueueName::BulkNotify, CLAIM).await.unwrap().unwrap();
        assert_eq!(claimed.id, other.id);
    }

    #[tokio::test]
    async fn running_job_is_not_claimed_twice_until_claim_expires() {
        let store = InMemoryJobStore::new();
        store.enqueue(job(QueueName::Finalize)).await.unwrap();

        let claimed = store
            .claim_next(QueueName::Finalize, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        // Zero timeout: the claim is already expired, so it is redelivered.
        let again = store
            .claim_next(QueueName::Finalize, CLAIM)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempt, 2);
        assert!(store.claim_next(QueueName::Finalize, CLAIM).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_removes_job() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(QueueName::Finalize)).await.unwrap();
        store.complete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(
            store.complete(id).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dead_letters_can_be_listed_retried_and_deleted() {
        let store = InMemoryJobStore::new();
        let j = job(QueueName::BulkNotify).with_retry_policy(RetryPolicy::no_retry());
        let id = store.enqueue(j).await.unwrap();

        let mut claimed = store.claim_next(QueueName::BulkNotify, CLAIM).await.unwrap().unwrap();
        claimed.mark_failed("smtp down".into(), Utc::now());
        store.dead_letter(claimed, "smtp down".into()).await.unwrap();

        let stats = store.stats(QueueName::BulkNotify).await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.pending, 0);

        let dls = store.list_dead_letters(QueueName::BulkNotify, 10).await.unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "smtp down");
        assert!(store.list_dead_letters(QueueName::Finalize, 10).await.unwrap().is_empty());

        let retried = store.retry_dead_letter(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt, 0);
        assert!(store.claim_next(QueueName::BulkNotify, CLAIM).await.unwrap().is_some());

        assert!(matches!(
            store.delete_dead_letter(id).await,
            Err(JobStoreError::NotFound(_))
        ));
    }
}
