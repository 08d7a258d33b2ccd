//! Handler-side ticket operations.
//!
//! Synchronous work (validation, state transitions, listings) happens here;
//! anything touching slow gateways is enqueued and finished by the workers.
//! Every mutation leaves the listing cache cold.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use ticketflow_core::{DomainError, TemplateId, TicketId};
use ticketflow_tickets::{
    DEFAULT_MAX_PROOF_BYTES, ProofUpload, Submission, Template, Ticket, TicketCommand, TicketEvent,
    proof_object_name,
};

use crate::cache::{CacheError, ListingCache};
use crate::dispatch::{DispatchError, TicketDispatcher};
use crate::jobs::{BulkNotifyJob, FinalizeJob, JobId, JobStoreError, OnboardingNotifyJob, QueueManager};
use crate::store::{
    AnalyticsSnapshot, AnalyticsStore, InMemoryAnalyticsStore, Pagination, StoreError,
    TemplateStore, TicketPage, TicketStats, TicketStore,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The job could not be enqueued.
    #[error("queue error: {0}")]
    Queue(#[from] JobStoreError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("ticket is busy, try again: {0}")]
    Busy(String),
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ServiceError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => ServiceError::InvariantViolation(msg),
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
            DomainError::NotFound => ServiceError::NotFound,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Rejected(e) => e.into(),
            other => ServiceError::Store(other),
        }
    }
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::NotFound => ServiceError::NotFound,
            DispatchError::Validation(msg) => ServiceError::Validation(msg),
            DispatchError::InvariantViolation(msg) => ServiceError::InvariantViolation(msg),
            DispatchError::Conflict(msg) => ServiceError::Conflict(msg),
            e @ DispatchError::Contended { .. } => ServiceError::Busy(e.to_string()),
            DispatchError::Store(e) => ServiceError::Store(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub max_upload_bytes: usize,
    /// Deprecated: verify stage-1 tickets that have no proof.
    pub legacy_stage1_verify: bool,
    /// Price per verified ticket, used for snapshot revenue.
    pub ticket_price: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_PROOF_BYTES,
            legacy_stage1_verify: false,
            ticket_price: 0,
        }
    }
}

#[derive(Clone)]
pub struct TicketService {
    tickets: Arc<dyn TicketStore>,
    templates: Arc<dyn TemplateStore>,
    snapshots: Arc<dyn AnalyticsStore>,
    queue: Arc<QueueManager>,
    dispatcher: TicketDispatcher,
    settings: ServiceSettings,
}

impl TicketService {
    pub fn new(
        dispatcher: TicketDispatcher,
        templates: Arc<dyn TemplateStore>,
        queue: Arc<QueueManager>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            tickets: dispatcher.store().clone(),
            templates,
            snapshots: InMemoryAnalyticsStore::arc(),
            queue,
            dispatcher,
            settings,
        }
    }

    /// Replace the default in-memory snapshot store.
    pub fn with_analytics_store(mut self, snapshots: Arc<dyn AnalyticsStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    fn cache(&self) -> &ListingCache {
        self.dispatcher.cache()
    }

    pub async fn submit(&self, submission: Submission) -> Result<TicketId, ServiceError> {
        let ticket = Ticket::submit(TicketId::new(), submission, Utc::now())?;
        let ticket = self.tickets.insert(ticket).await?;
        self.cache().invalidate_listings().await;
        info!(ticket_id = %ticket.id, "ticket submitted");
        Ok(ticket.id)
    }

    pub async fn get_ticket(&self, id: TicketId) -> Result<Ticket, ServiceError> {
        self.tickets.get(id).await?.ok_or(ServiceError::NotFound)
    }

    /// Validate the proof and hand it to the finalize queue.
    #[instrument(skip(self, id, upload), fields(ticket_id = %id, mime_type = %upload.mime_type, size = upload.bytes.len()))]
    pub async fn request_finalize(
        &self,
        id: TicketId,
        upload: ProofUpload,
    ) -> Result<JobId, ServiceError> {
        upload.validate(self.settings.max_upload_bytes)?;
        if self.tickets.get(id).await?.is_none() {
            return Err(ServiceError::NotFound);
        }

        let job = FinalizeJob {
            ticket_id: id,
            file_name: proof_object_name(id),
            mime_type: upload.mime_type,
            file_bytes: upload.bytes,
        };
        let job_id = self.queue.enqueue_finalize(&job).await?;
        self.cache().invalidate_listings().await;
        Ok(job_id)
    }

    pub async fn verify_payment(&self, id: TicketId) -> Result<Ticket, ServiceError> {
        let dispatched = self
            .dispatcher
            .dispatch(
                id,
                TicketCommand::VerifyPayment {
                    allow_legacy_stage1: self.settings.legacy_stage1_verify,
                },
            )
            .await?;

        let bypassed = dispatched
            .events
            .iter()
            .any(|e| matches!(e, TicketEvent::PaymentVerified { legacy_bypass: true }));
        if bypassed {
            warn!(ticket_id = %id, "payment verified without proof via deprecated stage-1 bypass");
        }
        Ok(dispatched.ticket)
    }

    pub async fn mark_given(
        &self,
        id: TicketId,
        ticket_number: impl Into<String>,
    ) -> Result<Ticket, ServiceError> {
        let command = TicketCommand::MarkGiven {
            ticket_number: ticket_number.into(),
        };
        Ok(self.dispatcher.dispatch(id, command).await?.ticket)
    }

    pub async fn toggle_entry(&self, id: TicketId) -> Result<Ticket, ServiceError> {
        Ok(self
            .dispatcher
            .dispatch(id, TicketCommand::ToggleEntry)
            .await?
            .ticket)
    }

    /// Newest first; page defaults to 1 and limit to 10.
    pub async fn list_tickets(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<TicketPage, ServiceError> {
        let page = Pagination::new(page, limit);
        let tickets = self.tickets.clone();
        self.cache()
            .get_or_compute(page, || async move { tickets.list(page).await })
            .await
            .map_err(ServiceError::from)
    }

    /// Match `query` against name, email and roll number, newest first.
    pub async fn search_tickets(
        &self,
        query: &str,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<TicketPage, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::Validation("search query is required".into()));
        }
        Ok(self
            .tickets
            .search(query, Pagination::new(page, limit))
            .await?)
    }

    /// Live counters, computed on every call.
    pub async fn analytics(&self) -> Result<TicketStats, ServiceError> {
        Ok(self.tickets.stats().await?)
    }

    /// Persist the current counters and revenue as a timestamped snapshot.
    #[instrument(skip(self))]
    pub async fn save_analytics(&self) -> Result<AnalyticsSnapshot, ServiceError> {
        let stats = self.tickets.stats().await?;
        let snapshot = AnalyticsSnapshot::capture(stats, self.settings.ticket_price, Utc::now());
        self.snapshots.save(&snapshot).await?;
        info!(
            total_tickets = stats.total_tickets,
            total_revenue = snapshot.total_revenue,
            "analytics snapshot saved"
        );
        Ok(snapshot)
    }

    pub async fn latest_analytics(&self) -> Result<Option<AnalyticsSnapshot>, ServiceError> {
        Ok(self.snapshots.latest().await?)
    }

    pub async fn create_template(
        &self,
        name: &str,
        subject: &str,
        body: &str,
    ) -> Result<Template, ServiceError> {
        let template = Template::new(TemplateId::new(), name, subject, body, Utc::now())?;
        self.templates.insert(template.clone()).await?;
        info!(template_id = %template.id, name = %template.name, "template created");
        Ok(template)
    }

    /// Refused once the template has been used for a bulk send.
    pub async fn update_template(
        &self,
        id: TemplateId,
        subject: &str,
        body: &str,
    ) -> Result<Template, ServiceError> {
        let mut template = self.templates.get(id).await?.ok_or(ServiceError::NotFound)?;
        template.revise(subject, body)?;
        self.templates.update(&template).await?;
        Ok(template)
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>, ServiceError> {
        Ok(self.templates.list().await?)
    }

    /// Lock the template and queue a send to every given ticket missing it.
    #[instrument(skip(self, template_id), fields(template_id = %template_id))]
    pub async fn send_bulk(&self, template_id: TemplateId) -> Result<JobId, ServiceError> {
        let template = self.templates.lock(template_id).await?;
        let job = BulkNotifyJob {
            template_id,
            subject: template.subject,
            body: template.body,
        };
        Ok(self.queue.enqueue_bulk_notify(&job).await?)
    }

    pub async fn send_onboarding(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<JobId, ServiceError> {
        if !to.contains('@') {
            return Err(ServiceError::Validation(format!("invalid recipient: {to}")));
        }
        let job = OnboardingNotifyJob {
            to: to.trim().to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        Ok(self.queue.enqueue_onboarding(&job).await?)
    }

    pub async fn cache_enabled(&self) -> Result<bool, ServiceError> {
        Ok(self.cache().is_enabled().await?)
    }

    pub async fn set_cache_enabled(&self, enabled: bool) -> Result<(), ServiceError> {
        self.cache().set_enabled(enabled).await?;
        info!(enabled, "listing cache toggled");
        Ok(())
    }
}
