//! Outbound email.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    /// No transport is configured; nothing can be sent.
    #[error("mail transport not configured")]
    NotConfigured,
    /// Transient provider failure.
    #[error("mail provider unreachable: {0}")]
    Unreachable(String),
    /// The provider refused this recipient or message.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl MailError {
    /// Errors that affect every recipient, not just the current one.
    pub fn is_gateway_failure(&self) -> bool {
        matches!(self, MailError::NotConfigured | MailError::Unreachable(_))
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<MessageId, MailError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub message_id: MessageId,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct MailerState {
    sent: Vec<SentMail>,
    scripted_failures: VecDeque<MailError>,
    rejected: HashSet<String>,
}

/// Recording mailer with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryMailer {
    state: Mutex<MailerState>,
    next_id: AtomicU64,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next send with `error`; queued failures are used in order.
    pub fn fail_next(&self, error: MailError) {
        self.lock().scripted_failures.push_back(error);
    }

    /// Reject every message to `address`.
    pub fn reject_recipient(&self, address: impl Into<String>) {
        self.lock().rejected.insert(address.into());
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<SentMail> {
        self.lock()
            .sent
            .iter()
            .filter(|m| m.to == address)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Mailer for InMemoryMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<MessageId, MailError> {
        let mut state = self.lock();
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        if state.rejected.contains(to) {
            return Err(MailError::Rejected(format!("recipient refused: {to}")));
        }

        let message_id = MessageId(format!(
            "mem-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ));
        state.sent.push(SentMail {
            message_id: message_id.clone(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(message_id)
    }
}

/// Mailer used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<MessageId, MailError> {
        Err(MailError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_and_injects_failures() {
        let mailer = InMemoryMailer::new();
        mailer.fail_next(MailError::Unreachable("timeout".into()));
        mailer.reject_recipient("bounce@example.edu");

        assert!(matches!(
            mailer.send("a@example.edu", "s", "b").await,
            Err(MailError::Unreachable(_))
        ));
        let id = mailer.send("a@example.edu", "s", "b").await.unwrap();
        assert_eq!(id, MessageId("mem-1".into()));
        assert!(matches!(
            mailer.send("bounce@example.edu", "s", "b").await,
            Err(MailError::Rejected(_))
        ));
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn disabled_mailer_is_not_configured() {
        let err = DisabledMailer.send("a@example.edu", "s", "b").await.unwrap_err();
        assert_eq!(err, MailError::NotConfigured);
        assert!(err.is_gateway_failure());
    }
}
