//! Enqueue side of the job system.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::payloads::{BulkNotifyJob, FinalizeJob, OnboardingNotifyJob};
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, Job, JobId, QueueName, RetryPolicy};

/// Entry point for producers and operators.
///
/// Built once at start-up and shared by `Arc`; every job enqueued through it
/// carries the retry policy configured for its queue.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    policies: HashMap<QueueName, RetryPolicy>,
    default_policy: RetryPolicy,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            policies: HashMap::new(),
            default_policy: RetryPolicy::default(),
        }
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_policy(mut self, queue: QueueName, policy: RetryPolicy) -> Self {
        self.policies.insert(queue, policy);
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn policy(&self, queue: QueueName) -> &RetryPolicy {
        self.policies.get(&queue).unwrap_or(&self.default_policy)
    }

    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
    ) -> Result<JobId, JobStoreError> {
        let job = Job::new(queue, payload).with_retry_policy(self.policy(queue).clone());
        let id = self.store.enqueue(job).await?;
        info!(job_id = %id, queue = %queue, "job enqueued");
        Ok(id)
    }

    pub async fn enqueue_finalize(&self, job: &FinalizeJob) -> Result<JobId, JobStoreError> {
        self.enqueue(QueueName::Finalize, to_payload(job)?).await
    }

    pub async fn enqueue_bulk_notify(&self, job: &BulkNotifyJob) -> Result<JobId, JobStoreError> {
        self.enqueue(QueueName::BulkNotify, to_payload(job)?).await
    }

    pub async fn enqueue_onboarding(
        &self,
        job: &OnboardingNotifyJob,
    ) -> Result<JobId, JobStoreError> {
        self.enqueue(QueueName::OnboardingNotify, to_payload(job)?)
            .await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        self.store.stats(queue).await
    }

    pub async fn dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.store.list_dead_letters(queue, limit).await
    }

    pub async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.retry_dead_letter(job_id).await?;
        info!(job_id = %job_id, queue = %job.queue, "dead letter requeued");
        Ok(job)
    }

    pub async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.store.delete_dead_letter(job_id).await
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(payload).map_err(|e| JobStoreError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ticketflow_core::TemplateId;

    use crate::jobs::store::InMemoryJobStore;

    #[tokio::test]
    async fn enqueue_applies_queue_policy() {
        let store = InMemoryJobStore::arc();
        let manager = QueueManager::new(store.clone())
            .with_default_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
            .with_policy(QueueName::BulkNotify, RetryPolicy::fixed(7, Duration::ZERO));

        let bulk = manager
            .enqueue_bulk_notify(&BulkNotifyJob {
                template_id: TemplateId::new(),
                subject: "Hi".into(),
                body: "Hello {{name}}".into(),
            })
            .await
            .unwrap();
        let onboarding = manager
            .enqueue_onboarding(&OnboardingNotifyJob {
                to: "admin@example.edu".into(),
                subject: "Welcome".into(),
                body: "You are an admin now".into(),
            })
            .await
            .unwrap();

        let bulk = manager.get(bulk).await.unwrap().unwrap();
        assert_eq!(bulk.queue, QueueName::BulkNotify);
        assert_eq!(bulk.retry_policy.max_attempts, 7);

        let onboarding = manager.get(onboarding).await.unwrap().unwrap();
        assert_eq!(onboarding.retry_policy.max_attempts, 3);
        let payload: OnboardingNotifyJob = onboarding.payload_as().unwrap();
        assert_eq!(payload.to, "admin@example.edu");

        assert_eq!(manager.stats(QueueName::BulkNotify).await.unwrap().pending, 1);
    }
}
