//! Template notifications.
//!
//! Bulk sends are deduplicated through each ticket's `templates_sent`
//! history: the batch query excludes tickets that already hold the template
//! and the append after a send is conditional on the same field, so
//! retries and duplicate enqueues reach each ticket at most once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use ticketflow_tickets::{Ticket, render_for};

use crate::cache::ListingCache;
use crate::gateways::{MailError, Mailer};
use crate::jobs::{BulkNotifyJob, Job, JobHandler, JobResult, OnboardingNotifyJob};
use crate::store::{StoreError, TicketStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Tickets returned by the eligibility query.
    pub matched: usize,
    pub sent: usize,
    /// Tickets without a usable recipient address.
    pub skipped: usize,
    /// Per-recipient rejections or unrecorded sends; the batch continued past them.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// The transport is down or not configured; every later send would fail too.
    #[error("mail gateway unavailable after {sent} sends: {source}")]
    Gateway { source: MailError, sent: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BulkNotifyWorker {
    tickets: Arc<dyn TicketStore>,
    mailer: Arc<dyn Mailer>,
    cache: ListingCache,
}

impl BulkNotifyWorker {
    pub fn new(tickets: Arc<dyn TicketStore>, mailer: Arc<dyn Mailer>, cache: ListingCache) -> Self {
        Self {
            tickets,
            mailer,
            cache,
        }
    }

    #[instrument(skip(self, job), fields(template_id = %job.template_id))]
    pub async fn notify(&self, job: &BulkNotifyJob) -> Result<NotifyReport, NotifyError> {
        let recipients = self.tickets.awaiting_template(job.template_id).await?;
        let mut report = NotifyReport {
            matched: recipients.len(),
            ..NotifyReport::default()
        };

        let outcome = self.send_batch(job, &recipients, &mut report).await;
        if report.sent > 0 {
            self.cache.invalidate_listings().await;
        }
        outcome?;

        info!(
            matched = report.matched,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "bulk notification finished"
        );
        Ok(report)
    }

    async fn send_batch(
        &self,
        job: &BulkNotifyJob,
        recipients: &[Ticket],
        report: &mut NotifyReport,
    ) -> Result<(), NotifyError> {
        for ticket in recipients {
            let Some(to) = ticket.recipient() else {
                warn!(ticket_id = %ticket.id, "no recipient address, skipping");
                report.skipped += 1;
                continue;
            };

            let body = render_for(&job.body, ticket);
            match self.mailer.send(to, &job.subject, &body).await {
                Ok(message_id) => match self
                    .tickets
                    .record_template_sent(ticket.id, job.template_id, Utc::now())
                    .await
                {
                    Ok(recorded) => {
                        if !recorded {
                            warn!(ticket_id = %ticket.id, "template already recorded by a concurrent send");
                        }
                        report.sent += 1;
                        info!(ticket_id = %ticket.id, message_id = %message_id, "notification sent");
                    }
                    Err(e) => {
                        warn!(
                            ticket_id = %ticket.id,
                            message_id = %message_id,
                            error = %e,
                            "notification sent but not recorded"
                        );
                        report.failed += 1;
                    }
                },
                Err(e) if e.is_gateway_failure() => {
                    return Err(NotifyError::Gateway {
                        source: e,
                        sent: report.sent,
                    });
                }
                Err(e) => {
                    warn!(ticket_id = %ticket.id, error = %e, "notification rejected");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for BulkNotifyWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: BulkNotifyJob = match job.payload_as() {
            Ok(p) => p,
            Err(e) => return JobResult::Permanent(format!("invalid bulk-notify payload: {e}")),
        };

        match self.notify(&payload).await {
            Ok(_) => JobResult::Success,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

pub struct OnboardingNotifyWorker {
    mailer: Arc<dyn Mailer>,
}

impl OnboardingNotifyWorker {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for OnboardingNotifyWorker {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: OnboardingNotifyJob = match job.payload_as() {
            Ok(p) => p,
            Err(e) => return JobResult::Permanent(format!("invalid onboarding payload: {e}")),
        };

        match self
            .mailer
            .send(&payload.to, &payload.subject, &payload.body)
            .await
        {
            Ok(message_id) => {
                info!(to = %payload.to, message_id = %message_id, "onboarding mail sent");
                JobResult::Success
            }
            Err(e @ MailError::Rejected(_)) => JobResult::Permanent(e.to_string()),
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::DateTime;
    use std::sync::Mutex;

    use ticketflow_core::{Aggregate, ExpectedVersion, TemplateId, TicketId};
    use ticketflow_tickets::{Submission, TicketCommand};

    use crate::cache::InMemoryCacheBackend;
    use crate::gateways::InMemoryMailer;
    use crate::jobs::QueueName;
    use crate::store::{InMemoryTicketStore, Pagination, TicketPage, TicketStats};

    fn given(name: &str, number: &str) -> Ticket {
        let mut ticket = Ticket::submit(
            TicketId::new(),
            Submission {
                name: name.into(),
                email: format!("{}@example.edu", name.to_lowercase()),
                roll_number: "R-1".into(),
                contact_number: "9000000000".into(),
                degree: "B.Tech".into(),
                year: "4".into(),
                year_other: None,
                branch: "ME".into(),
                branch_other: None,
            },
            Utc::now(),
        )
        .unwrap();
        for cmd in [
            TicketCommand::RecordPaymentProof { proof: "memory://p".into() },
            TicketCommand::VerifyPayment { allow_legacy_stage1: false },
            TicketCommand::MarkGiven { ticket_number: number.into() },
        ] {
            for e in ticket.handle(&cmd).unwrap() {
                ticket.apply(&e);
            }
        }
        ticket
    }

    fn job(template_id: TemplateId) -> BulkNotifyJob {
        BulkNotifyJob {
            template_id,
            subject: "Your pass".into(),
            body: "Hi {{name}}, your ticket is {{ticket_number}}.".into(),
        }
    }

    async fn setup() -> (Arc<InMemoryTicketStore>, Arc<InMemoryMailer>, BulkNotifyWorker) {
        let store = InMemoryTicketStore::arc();
        let mailer = InMemoryMailer::arc();
        let worker = BulkNotifyWorker::new(
            store.clone(),
            mailer.clone(),
            ListingCache::new(InMemoryCacheBackend::arc()),
        );
        (store, mailer, worker)
    }

    #[tokio::test]
    async fn renders_each_recipient_and_records_the_send() {
        let (store, mailer, worker) = setup().await;
        let t = store.insert(given("Meera", "T-001")).await.unwrap();
        let template = TemplateId::new();

        let report = worker.notify(&job(template)).await.unwrap();
        assert_eq!(report.sent, 1);

        let sent = mailer.sent_to("meera@example.edu");
        assert_eq!(sent[0].body, "Hi Meera, your ticket is T-001.");
        assert!(store.get(t.id).await.unwrap().unwrap().has_received(template));
    }

    #[tokio::test]
    async fn rejected_recipient_does_not_stop_the_batch() {
        let (store, mailer, worker) = setup().await;
        store.insert(given("Bad", "T-1")).await.unwrap();
        store.insert(given("Good", "T-2")).await.unwrap();
        mailer.reject_recipient("bad@example.edu");

        let report = worker.notify(&job(TemplateId::new())).await.unwrap();
        assert_eq!(report, NotifyReport { matched: 2, sent: 1, skipped: 0, failed: 1 });
    }

    /// Store that fails `record_template_sent` for one chosen ticket.
    struct FailingRecord {
        inner: InMemoryTicketStore,
        failing: Mutex<Option<TicketId>>,
    }

    #[async_trait]
    impl TicketStore for FailingRecord {
        async fn insert(&self, ticket: Ticket) -> Result<Ticket, StoreError> {
            self.inner.insert(ticket).await
        }
        async fn get(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
            self.inner.get(id).await
        }
        async fn save(&self, ticket: &Ticket, expected: ExpectedVersion) -> Result<u64, StoreError> {
            self.inner.save(ticket, expected).await
        }
        async fn list(&self, page: Pagination) -> Result<TicketPage, StoreError> {
            self.inner.list(page).await
        }
        async fn search(&self, query: &str, page: Pagination) -> Result<TicketPage, StoreError> {
            self.inner.search(query, page).await
        }
        async fn awaiting_template(&self, t: TemplateId) -> Result<Vec<Ticket>, StoreError> {
            self.inner.awaiting_template(t).await
        }
        async fn record_template_sent(
            &self,
            id: TicketId,
            t: TemplateId,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            if *self.failing.lock().unwrap() == Some(id) {
                return Err(StoreError::Backend("write timeout".into()));
            }
            self.inner.record_template_sent(id, t, at).await
        }
        async fn stats(&self) -> Result<TicketStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn record_failure_does_not_stop_the_batch() {
        let store = Arc::new(FailingRecord {
            inner: InMemoryTicketStore::new(),
            failing: Mutex::new(None),
        });
        let mailer = InMemoryMailer::arc();
        let worker = BulkNotifyWorker::new(
            store.clone(),
            mailer.clone(),
            ListingCache::new(InMemoryCacheBackend::arc()),
        );
        let mut ids = Vec::new();
        for (name, number) in [("Asha", "T-1"), ("Bala", "T-2"), ("Chitra", "T-3")] {
            ids.push(store.insert(given(name, number)).await.unwrap().id);
        }
        let template = TemplateId::new();
        let oldest = store.awaiting_template(template).await.unwrap()[0].id;
        *store.failing.lock().unwrap() = Some(oldest);

        let report = worker.notify(&job(template)).await.unwrap();
        assert_eq!(report, NotifyReport { matched: 3, sent: 2, skipped: 0, failed: 1 });
        assert_eq!(mailer.sent().len(), 3);

        for id in ids {
            let ticket = store.get(id).await.unwrap().unwrap();
            assert_eq!(ticket.has_received(template), id != oldest);
        }
    }

    #[tokio::test]
    async fn gateway_outage_is_retried_without_resending() {
        let (store, mailer, worker) = setup().await;
        store.insert(given("One", "T-1")).await.unwrap();
        store.insert(given("Two", "T-2")).await.unwrap();
        let template = TemplateId::new();

        mailer.fail_next(MailError::Unreachable("connection reset".into()));
        let payload = serde_json::to_value(job(template)).unwrap();
        let queued = Job::new(QueueName::BulkNotify, payload);
        assert!(matches!(worker.handle(&queued).await, JobResult::Failure(_)));

        assert_eq!(worker.handle(&queued).await, JobResult::Success);
        assert_eq!(mailer.sent().len(), 2);

        let report = worker.notify(&job(template)).await.unwrap();
        assert_eq!(report.matched, 0);
        assert_eq!(mailer.sent().len(), 2);
    }

    #[tokio::test]
    async fn onboarding_rejection_is_permanent() {
        let mailer = InMemoryMailer::arc();
        mailer.reject_recipient("nobody@example.edu");
        let worker = OnboardingNotifyWorker::new(mailer.clone());

        let payload = serde_json::to_value(OnboardingNotifyJob {
            to: "nobody@example.edu".into(),
            subject: "Welcome".into(),
            body: "Hello".into(),
        })
        .unwrap();
        let job = Job::new(QueueName::OnboardingNotify, payload);
        assert!(matches!(worker.handle(&job).await, JobResult::Permanent(_)));

        mailer.fail_next(MailError::Unreachable("timeout".into()));
        let payload = serde_json::to_value(OnboardingNotifyJob {
            to: "someone@example.edu".into(),
            subject: "Welcome".into(),
            body: "Hello".into(),
        })
        .unwrap();
        let job = Job::new(QueueName::OnboardingNotify, payload);
        assert!(matches!(worker.handle(&job).await, JobResult::Failure(_)));
        assert_eq!(worker.handle(&job).await, JobResult::Success);
    }
}
