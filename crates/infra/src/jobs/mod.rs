//! Background job system with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Three isolated queues: `finalize`, `bulk-notify`, `onboarding-notify`
//! - At-least-once delivery; claims carry a visibility timeout and are
//!   handed out again when a worker dies mid-job
//! - Retry policy with fixed, linear or exponential backoff
//! - Dead-letter set for jobs that failed permanently or ran out of attempts
//!
//! ## Components
//!
//! - `Job`: queued unit of work with JSON payload and attempt history
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `QueueManager`: producer/operator API with per-queue retry policies
//! - `JobExecutor`: runs claimed jobs through the handler of their queue

pub mod executor;
pub mod payloads;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler, JobOutcome,
};
pub use payloads::{BulkNotifyJob, FinalizeJob, OnboardingNotifyJob};
pub use postgres::PostgresJobStore;
pub use queue::QueueManager;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobId, JobResult, JobStatus, QueueName, RetryPolicy,
};
