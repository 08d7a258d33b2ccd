//! Command execution pipeline for tickets.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load ticket from store (with its version)
//!   ↓
//! 2. Handle command (pure decision logic, produces events)
//!   ↓
//! 3. Apply events to the loaded state
//!   ↓
//! 4. Compare-and-swap save on the loaded version
//!   ↓
//! 5. Invalidate the listing cache
//! ```
//!
//! A version conflict in step 4 restarts from step 1, so two concurrent
//! commands on one ticket are serialized instead of one overwriting the
//! other. A command that yields no events is already satisfied and writes
//! nothing.

use std::sync::Arc;

use tracing::{debug, info};

use ticketflow_core::{Aggregate, DomainError, ExpectedVersion, TicketId};
use ticketflow_tickets::{Ticket, TicketCommand, TicketEvent};

use crate::cache::ListingCache;
use crate::store::{StoreError, TicketStore};

const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("ticket not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// Repeated one-way transition (e.g. giving a ticket twice).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Version conflicts persisted through every retry.
    #[error("concurrent updates did not settle after {attempts} attempts")]
    Contended { attempts: u32 },
    #[error(transparent)]
    Store(StoreError),
}

impl DispatchError {
    /// Deterministic failures that a retry cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::NotFound
                | DispatchError::Validation(_)
                | DispatchError::InvariantViolation(_)
                | DispatchError::Conflict(_)
        )
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                DispatchError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => DispatchError::NotFound,
            StoreError::Rejected(e) => e.into(),
            other => DispatchError::Store(other),
        }
    }
}

/// Result of a dispatched command.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// State after the command, with its persisted version.
    pub ticket: Ticket,
    /// Empty when the command was already satisfied.
    pub events: Vec<TicketEvent>,
}

#[derive(Clone)]
pub struct TicketDispatcher {
    store: Arc<dyn TicketStore>,
    cache: ListingCache,
    max_conflict_retries: u32,
}

impl TicketDispatcher {
    pub fn new(store: Arc<dyn TicketStore>, cache: ListingCache) -> Self {
        Self {
            store,
            cache,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    pub async fn dispatch(
        &self,
        id: TicketId,
        command: TicketCommand,
    ) -> Result<Dispatched, DispatchError> {
        for attempt in 1..=self.max_conflict_retries {
            let mut ticket = self.store.get(id).await?.ok_or(DispatchError::NotFound)?;
            let events = ticket.handle(&command)?;
            if events.is_empty() {
                debug!(ticket_id = %id, ?command, "command already satisfied");
                return Ok(Dispatched { ticket, events });
            }

            let expected = ExpectedVersion::Exact(ticket.version);
            for event in &events {
                ticket.apply(event);
            }

            match self.store.save(&ticket, expected).await {
                Ok(version) => {
                    ticket.version = version;
                    for event in &events {
                        info!(ticket_id = %id, event_type = event.event_type(), version, "ticket updated");
                    }
                    self.cache.invalidate_listings().await;
                    return Ok(Dispatched { ticket, events });
                }
                Err(StoreError::Concurrency(msg)) => {
                    debug!(ticket_id = %id, attempt, reason = %msg, "version conflict, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DispatchError::Contended {
            attempts: self.max_conflict_retries,
        })
    }
}
