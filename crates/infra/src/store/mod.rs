//! Persistent stores for tickets, templates and analytics snapshots.
//!
//! The ticket store is the single source of truth. Every write goes through
//! `Ticket::check_transition`, so a record violating the lifecycle
//! invariants is never persisted, whatever path produced it.

pub mod analytics;
pub mod postgres;
pub mod templates;
pub mod tickets;

use serde::{Deserialize, Serialize};

use ticketflow_core::DomainError;
use ticketflow_tickets::Ticket;

pub use analytics::{AnalyticsSnapshot, AnalyticsStore, InMemoryAnalyticsStore};
pub use postgres::{PostgresAnalyticsStore, PostgresTemplateStore, PostgresTicketStore};
pub use templates::{InMemoryTemplateStore, TemplateStore};
pub use tickets::{InMemoryTicketStore, TicketStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    /// Stale `ExpectedVersion`; reload and retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// The write was refused by a domain rule.
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Concurrency(_))
    }
}

/// Page request for ticket listings (1-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub const DEFAULT_PAGE: u32 = 1;
    pub const DEFAULT_LIMIT: u32 = 10;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(Self::DEFAULT_PAGE).max(1),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of tickets, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPage {
    pub tickets: Vec<Ticket>,
    pub page: u32,
    pub limit: u32,
    /// Number of tickets across all pages.
    pub total: u64,
}

impl TicketPage {
    pub fn total_pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.limit.max(1)))
    }
}

/// Counters shown on the admin dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStats {
    pub total_tickets: u64,
    pub stage2: u64,
    pub verified_payments: u64,
    pub given_tickets: u64,
    pub entries_marked: u64,
}
