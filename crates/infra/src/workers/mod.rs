//! Queue handlers and the pool that registers them.

pub mod finalize;
pub mod notify;

use std::sync::Arc;

use crate::jobs::{JobExecutor, JobExecutorConfig, JobExecutorHandle, JobStore, QueueName};

pub use finalize::{FinalizeError, FinalizeReport, FinalizeSettings, FinalizeWorker, ledger_row};
pub use notify::{BulkNotifyWorker, NotifyError, NotifyReport, OnboardingNotifyWorker};

/// One handler per queue, built once at start-up.
#[derive(Clone)]
pub struct WorkerPool {
    pub finalize: Arc<FinalizeWorker>,
    pub bulk_notify: Arc<BulkNotifyWorker>,
    pub onboarding: Arc<OnboardingNotifyWorker>,
}

impl WorkerPool {
    pub fn new(
        finalize: FinalizeWorker,
        bulk_notify: BulkNotifyWorker,
        onboarding: OnboardingNotifyWorker,
    ) -> Self {
        Self {
            finalize: Arc::new(finalize),
            bulk_notify: Arc::new(bulk_notify),
            onboarding: Arc::new(onboarding),
        }
    }

    /// Executor with every queue wired to its handler.
    pub fn executor(&self, store: Arc<dyn JobStore>) -> JobExecutor {
        let mut executor = JobExecutor::new(store);
        executor.register_handler(QueueName::Finalize, self.finalize.clone());
        executor.register_handler(QueueName::BulkNotify, self.bulk_notify.clone());
        executor.register_handler(QueueName::OnboardingNotify, self.onboarding.clone());
        executor
    }

    pub fn spawn(&self, store: Arc<dyn JobStore>, config: JobExecutorConfig) -> JobExecutorHandle {
        self.executor(store).spawn(config)
    }
}
