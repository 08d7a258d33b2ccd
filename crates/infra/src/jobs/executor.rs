//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobResult, JobStatus, QueueName};

/// Handler for the jobs of one queue.
///
/// Handlers must be idempotent: a job can be delivered more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often an idle queue is polled for new jobs
    pub poll_interval: Duration,
    /// Maximum concurrent jobs per queue
    pub max_concurrent: usize,
    /// Visibility timeout of a claim
    pub claim_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_concurrent: 4,
            claim_timeout: Duration::from_secs(300),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    DeadLettered,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "queue loop panicked");
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background job executor.
///
/// Runs one loop per registered queue. Each loop claims jobs from the store,
/// executes them with the queue's handler (up to `max_concurrent` at a time)
/// and handles retries and dead-lettering.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, queue: QueueName, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue, handler);
    }

    pub fn queues(&self) -> impl Iterator<Item = QueueName> + '_ {
        self.handlers.keys().copied()
    }

    /// Spawn one loop per registered queue on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let tasks = self
            .handlers
            .into_iter()
            .map(|(queue, handler)| {
                tokio::spawn(queue_loop(
                    queue,
                    self.store.clone(),
                    handler,
                    config.clone(),
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        JobExecutorHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }

    /// Execute a single claimed job (for testing or synchronous use).
    pub async fn execute_one(&self, job: &mut Job) -> Result<JobOutcome, JobStoreError> {
        match self.handlers.get(&job.queue) {
            Some(handler) => run_job(self.store.as_ref(), handler.as_ref(), job).await,
            None => {
                let error = format!("no handler for queue: {}", job.queue);
                job.mark_permanent(error.clone(), Utc::now());
                self.store.dead_letter(job.clone(), error).await?;
                Ok(JobOutcome::DeadLettered)
            }
        }
    }
}

async fn queue_loop(
    queue: QueueName,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    config: JobExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, queue = %queue, "queue loop started");
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match store.claim_next(queue, config.claim_timeout).await {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    queue = %queue,
                    job_id = %job.id,
                    attempt = job.attempt,
                    "claimed job"
                );
                update_stats(&stats, |s| s.current_running += 1);

                let store = store.clone();
                let handler = handler.clone();
                let stats = stats.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let outcome = run_job(store.as_ref(), handler.as_ref(), &mut job).await;
                    update_stats(&stats, |s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.jobs_processed += 1;
                        match &outcome {
                            Ok(JobOutcome::Completed) => s.jobs_succeeded += 1,
                            Ok(JobOutcome::Retrying) => s.jobs_failed += 1,
                            Ok(JobOutcome::DeadLettered) => {
                                s.jobs_failed += 1;
                                s.jobs_dead_lettered += 1;
                            }
                            Err(_) => s.jobs_failed += 1,
                        }
                    });
                    if let Err(e) = outcome {
                        // The claim will expire and the job is redelivered.
                        error!(job_id = %job.id, error = %e, "failed to persist job outcome");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                if idle(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(executor = %config.name, queue = %queue, error = %e, "failed to claim job");
                if idle(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    info!(executor = %config.name, queue = %queue, "queue loop stopped");
}

/// Sleep for one poll interval; returns true when shutdown was requested.
async fn idle(shutdown: &mut watch::Receiver<bool>, poll_interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(poll_interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn update_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

async fn run_job(
    store: &dyn JobStore,
    handler: &dyn JobHandler,
    job: &mut Job,
) -> Result<JobOutcome, JobStoreError> {
    let started = Utc::now();

    match handler.handle(job).await {
        JobResult::Success => {
            job.mark_completed(started);
            store.complete(job.id).await?;
            info!(job_id = %job.id, queue = %job.queue, attempt = job.attempt, "job completed");
            return Ok(JobOutcome::Completed);
        }
        JobResult::Failure(error) => job.mark_failed(error, started),
        JobResult::Permanent(error) => job.mark_permanent(error, started),
    }

    match &job.status {
        JobStatus::DeadLettered { error, attempts } => {
            error!(
                job_id = %job.id,
                queue = %job.queue,
                attempts = *attempts,
                error = %error,
                "job dead-lettered"
            );
            let reason = error.clone();
            store.dead_letter(job.clone(), reason).await?;
            Ok(JobOutcome::DeadLettered)
        }
        JobStatus::Retrying { error, attempt } => {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempt = *attempt,
                error = %error,
                retry_at = ?job.scheduled_at,
                "job failed, retry scheduled"
            );
            store.update(job).await?;
            Ok(JobOutcome::Retrying)
        }
        JobStatus::Pending | JobStatus::Running => {
            store.update(job).await?;
            Ok(JobOutcome::Retrying)
        }
    }
}
