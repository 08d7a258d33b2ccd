//! Finalize worker: store the payment proof, advance the ticket to stage "2"
//! and mirror it to the ledger.
//!
//! Redelivery is safe: the object key comes from the job's `file_name`
//! (re-upload overwrites), recording an identical proof is a no-op, and the ledger row
//! is only appended while `ledger_recorded_at` is unset.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use ticketflow_tickets::{Ticket, TicketCommand, proof_object_name};

use crate::dispatch::{DispatchError, TicketDispatcher};
use crate::gateways::{LedgerMirror, ObjectRef, ObjectStore, ObjectStoreError};
use crate::jobs::{FinalizeJob, Job, JobHandler, JobResult};

const MISSING_VALUE: &str = "undefined";
const MISSING_PROOF: &str = "null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeSettings {
    pub bucket: String,
    pub ledger_range: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub object: ObjectRef,
    /// Whether this run appended the ledger row.
    pub ledger_appended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FinalizeError {
    #[error("proof upload failed: {0}")]
    Upload(#[from] ObjectStoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl FinalizeError {
    pub fn is_permanent(&self) -> bool {
        match self {
            FinalizeError::Upload(ObjectStoreError::Rejected(_)) => true,
            FinalizeError::Upload(ObjectStoreError::Unavailable(_)) => false,
            FinalizeError::Dispatch(e) => e.is_permanent(),
        }
    }
}

pub struct FinalizeWorker {
    objects: Arc<dyn ObjectStore>,
    ledger: Arc<dyn LedgerMirror>,
    dispatcher: TicketDispatcher,
    settings: FinalizeSettings,
}

impl FinalizeWorker {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        ledger: Arc<dyn LedgerMirror>,
        dispatcher: TicketDispatcher,
        settings: FinalizeSettings,
    ) -> Self {
        Self {
            objects,
            ledger,
            dispatcher,
            settings,
        }
    }

    #[instrument(skip(self, job), fields(ticket_id = %job.ticket_id, mime_type = %job.mime_type))]
    pub async fn finalize(&self, job: &FinalizeJob) -> Result<FinalizeReport, FinalizeError> {
        let name = match job.file_name.trim() {
            "" => proof_object_name(job.ticket_id),
            name => name.to_string(),
        };
        let object = self
            .objects
            .upload(&self.settings.bucket, &job.file_bytes, &name, &job.mime_type)
            .await?;

        let dispatched = self
            .dispatcher
            .dispatch(
                job.ticket_id,
                TicketCommand::RecordPaymentProof {
                    proof: object.url.clone(),
                },
            )
            .await?;
        info!(proof = %object.url, "payment proof recorded");

        let ticket = dispatched.ticket;
        let ledger_appended = if ticket.ledger_recorded_at.is_none() {
            self.mirror_to_ledger(&ticket).await
        } else {
            false
        };

        Ok(FinalizeReport {
            object,
            ledger_appended,
        })
    }

    /// Ledger failures are logged and never fail the job.
    async fn mirror_to_ledger(&self, ticket: &Ticket) -> bool {
        if let Err(e) = self
            .ledger
            .append_row(&self.settings.ledger_range, ledger_row(ticket))
            .await
        {
            warn!(ticket_id = %ticket.id, error = %e, "ledger append failed");
            return false;
        }

        let recorded = self
            .dispatcher
            .dispatch(
                ticket.id,
                TicketCommand::RecordLedgerRow {
                    recorded_at: Utc::now(),
                },
            )
            .await;
        if let Err(e) = recorded {
            warn!(ticket_id = %ticket.id, error = %e, "ledger row appended but not recorded");
        }
        true
    }
}

#[async_trait]
impl JobHandler for FinalizeWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: FinalizeJob = match job.payload_as() {
            Ok(p) => p,
            Err(e) => return JobResult::Permanent(format!("invalid finalize payload: {e}")),
        };

        match self.finalize(&payload).await {
            Ok(_) => JobResult::Success,
            Err(e) if e.is_permanent() => JobResult::Permanent(e.to_string()),
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

/// One spreadsheet row per finalized ticket.
pub fn ledger_row(ticket: &Ticket) -> Vec<String> {
    let text = |value: &str| {
        if value.is_empty() {
            MISSING_VALUE.to_string()
        } else {
            value.to_string()
        }
    };

    vec![
        readable_timestamp(ticket.created_at),
        text(&ticket.email),
        text(&ticket.name),
        text(&ticket.roll_number),
        text(&ticket.contact_number),
        text(&ticket.degree),
        text(&ticket.year),
        text(&ticket.branch),
        ticket
            .payment_proof
            .clone()
            .unwrap_or_else(|| MISSING_PROOF.to_string()),
    ]
}

/// e.g. `Monday, January 6, 2025, 02:03:04 PM UTC`
pub fn readable_timestamp(at: DateTime<Utc>) -> String {
    at.format("%A, %B %-d, %Y, %I:%M:%S %p UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use ticketflow_core::TicketId;
    use ticketflow_tickets::Submission;

    use crate::cache::{InMemoryCacheBackend, ListingCache};
    use crate::gateways::object_store::object_key;
    use crate::gateways::{InMemoryLedger, InMemoryObjectStore};
    use crate::store::{InMemoryTicketStore, TicketStore};

    fn submission() -> Submission {
        Submission {
            name: "Asha".into(),
            email: "asha@example.edu".into(),
            roll_number: "21CS042".into(),
            contact_number: "9876543210".into(),
            degree: String::new(),
            year: "3".into(),
            year_other: None,
            branch: "CSE".into(),
            branch_other: None,
        }
    }

    async fn worker() -> (FinalizeWorker, Arc<InMemoryObjectStore>, TicketId) {
        let store = InMemoryTicketStore::arc();
        let ticket = Ticket::submit(TicketId::new(), submission(), Utc::now()).unwrap();
        let id = store.insert(ticket).await.unwrap().id;
        let objects = InMemoryObjectStore::arc();
        let worker = FinalizeWorker::new(
            objects.clone(),
            InMemoryLedger::arc(),
            TicketDispatcher::new(store, ListingCache::new(InMemoryCacheBackend::arc())),
            FinalizeSettings {
                bucket: "proofs".into(),
                ledger_range: "Sheet1!A1".into(),
            },
        );
        (worker, objects, id)
    }

    #[tokio::test]
    async fn upload_uses_the_job_file_name() {
        let (worker, objects, id) = worker().await;
        let job = FinalizeJob {
            ticket_id: id,
            file_bytes: vec![1, 2, 3],
            file_name: "receipt_asha".into(),
            mime_type: "image/png".into(),
        };

        let report = worker.finalize(&job).await.unwrap();
        assert_eq!(report.object.key, "receipt_asha.png");
        assert!(objects.object("proofs", &object_key("receipt_asha", "image/png")).is_some());
    }

    #[tokio::test]
    async fn blank_file_name_falls_back_to_the_ticket_key() {
        let (worker, _, id) = worker().await;
        let job = FinalizeJob {
            ticket_id: id,
            file_bytes: vec![1],
            file_name: "  ".into(),
            mime_type: "application/pdf".into(),
        };

        let report = worker.finalize(&job).await.unwrap();
        assert_eq!(report.object.key, format!("payment_proof_{id}.pdf"));
    }

    #[test]
    fn timestamp_is_human_readable() {
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 14, 3, 4).unwrap();
        assert_eq!(readable_timestamp(at), "Monday, January 6, 2025, 02:03:04 PM UTC");
    }

    #[test]
    fn ledger_row_fills_missing_values() {
        let created = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        let mut ticket = Ticket::submit(TicketId::new(), submission(), created).unwrap();

        let row = ledger_row(&ticket);
        assert_eq!(row.len(), 9);
        assert_eq!(row[0], "Monday, January 6, 2025, 09:00:00 AM UTC");
        assert_eq!(row[5], "undefined");
        assert_eq!(row[8], "null");

        ticket.payment_proof = Some("memory://bucket/p.pdf".into());
        assert_eq!(ledger_row(&ticket)[8], "memory://bucket/p.pdf");
    }

    #[test]
    fn only_rejected_uploads_are_permanent() {
        assert!(FinalizeError::Upload(ObjectStoreError::Rejected("bad".into())).is_permanent());
        assert!(!FinalizeError::Upload(ObjectStoreError::Unavailable("down".into())).is_permanent());
        assert!(FinalizeError::Dispatch(DispatchError::NotFound).is_permanent());
    }
}
