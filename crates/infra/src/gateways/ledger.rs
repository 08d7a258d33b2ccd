//! Append-only spreadsheet mirror of finalized tickets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger rejected row: {0}")]
    Rejected(String),
}

/// Not idempotent: every successful call adds a row.
#[async_trait]
pub trait LedgerMirror: Send + Sync {
    async fn append_row(&self, range: &str, values: Vec<String>) -> Result<(), LedgerError>;
}

#[derive(Debug)]
pub struct InMemoryLedger {
    rows: RwLock<Vec<(String, Vec<String>)>>,
    available: AtomicBool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Rows appended so far, with the range each was written to.
    pub fn rows(&self) -> Vec<(String, Vec<String>)> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LedgerMirror for InMemoryLedger {
    async fn append_row(&self, range: &str, values: Vec<String>) -> Result<(), LedgerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("spreadsheet API unreachable".into()));
        }
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((range.to_string(), values));
        Ok(())
    }
}
