//! Ticket store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ticketflow_core::{Aggregate, ExpectedVersion, TemplateId, TicketId};
use ticketflow_tickets::{Stage, Ticket, TicketCommand};

use super::{Pagination, StoreError, TicketPage, TicketStats};

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persist a new ticket. Returns it with its first version (1).
    async fn insert(&self, ticket: Ticket) -> Result<Ticket, StoreError>;

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, StoreError>;

    /// Compare-and-swap write of a mutated ticket. Returns the new version.
    ///
    /// Fails with `Concurrency` when the stored version does not match
    /// `expected`, and with `Rejected` when the new state is not a legal
    /// successor of the stored one.
    async fn save(&self, ticket: &Ticket, expected: ExpectedVersion) -> Result<u64, StoreError>;

    /// Tickets sorted by `created_at` descending.
    async fn list(&self, page: Pagination) -> Result<TicketPage, StoreError>;

    /// Case-insensitive substring match on name, email or roll number,
    /// newest first. `total` counts matches only.
    async fn search(&self, query: &str, page: Pagination) -> Result<TicketPage, StoreError>;

    /// Given tickets that have not received `template_id` yet, oldest first.
    async fn awaiting_template(&self, template_id: TemplateId) -> Result<Vec<Ticket>, StoreError>;

    /// Atomically append `(template_id, sent_at)` unless already present.
    ///
    /// Returns `false` when the template was already recorded.
    async fn record_template_sent(
        &self,
        id: TicketId,
        template_id: TemplateId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<TicketStats, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert(&self, mut ticket: Ticket) -> Result<Ticket, StoreError> {
        ticket.check_invariants()?;
        let mut tickets = self.tickets.write().unwrap_or_else(PoisonError::into_inner);
        if tickets.contains_key(&ticket.id) {
            return Err(StoreError::AlreadyExists(ticket.id.to_string()));
        }
        ticket.version = 1;
        tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        let tickets = self.tickets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tickets.get(&id).cloned())
    }

    async fn save(&self, ticket: &Ticket, expected: ExpectedVersion) -> Result<u64, StoreError> {
        let mut tickets = self.tickets.write().unwrap_or_else(PoisonError::into_inner);
        let stored = tickets.get_mut(&ticket.id).ok_or(StoreError::NotFound)?;

        if !expected.matches(stored.version) {
            return Err(StoreError::Concurrency(format!(
                "ticket {} is at version {}, expected {expected:?}",
                ticket.id, stored.version
            )));
        }
        stored.check_transition(ticket)?;

        let version = stored.version + 1;
        *stored = Ticket {
            version,
            ..ticket.clone()
        };
        Ok(version)
    }

    async fn list(&self, page: Pagination) -> Result<TicketPage, StoreError> {
        let tickets = self.tickets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(paginate(tickets.values().collect(), page))
    }

    async fn search(&self, query: &str, page: Pagination) -> Result<TicketPage, StoreError> {
        let needle = query.trim().to_lowercase();
        let tickets = self.tickets.read().unwrap_or_else(PoisonError::into_inner);
        let matched = tickets
            .values()
            .filter(|t| {
                [&t.name, &t.email, &t.roll_number]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect();
        Ok(paginate(matched, page))
    }

    async fn awaiting_template(&self, template_id: TemplateId) -> Result<Vec<Ticket>, StoreError> {
        let tickets = self.tickets.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<Ticket> = tickets
            .values()
            .filter(|t| t.ticket_given && !t.has_received(template_id))
            .cloned()
            .collect();
        matched.sort_by_key(|t| (t.created_at, t.id));
        Ok(matched)
    }

    async fn record_template_sent(
        &self,
        id: TicketId,
        template_id: TemplateId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tickets = self.tickets.write().unwrap_or_else(PoisonError::into_inner);
        let stored = tickets.get_mut(&id).ok_or(StoreError::NotFound)?;
        let events = stored.handle(&TicketCommand::RecordTemplateSent {
            template_id,
            sent_at,
        })?;
        if events.is_empty() {
            return Ok(false);
        }
        for event in &events {
            stored.apply(event);
        }
        stored.version += 1;
        Ok(true)
    }

    async fn stats(&self) -> Result<TicketStats, StoreError> {
        let tickets = self.tickets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tally(tickets.values()))
    }
}

fn paginate(mut all: Vec<&Ticket>, page: Pagination) -> TicketPage {
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    let total = all.len() as u64;
    let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);

    TicketPage {
        tickets: all
            .into_iter()
            .skip(offset)
            .take(page.limit as usize)
            .cloned()
            .collect(),
        page: page.page,
        limit: page.limit,
        total,
    }
}

fn tally<'a>(tickets: impl Iterator<Item = &'a Ticket>) -> TicketStats {
    tickets.fold(TicketStats::default(), |mut s, t| {
        s.total_tickets += 1;
        s.stage2 += u64::from(t.stage == Stage::ProofUploaded);
        s.verified_payments += u64::from(t.payment_verified);
        s.given_tickets += u64::from(t.ticket_given);
        s.entries_marked += u64::from(t.entry_marked);
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticketflow_tickets::Submission;

    fn submission(name: &str) -> Submission {
        Submission {
            name: name.to_string(),
            email: format!("{}@example.edu", name.to_lowercase()),
            roll_number: "R-1".into(),
            contact_number: "9999999999".into(),
            degree: "B.Sc".into(),
            year: "2".into(),
            year_other: None,
            branch: "Physics".into(),
            branch_other: None,
        }
    }

    fn ticket_at(name: &str, secs: i64) -> Ticket {
        let created = DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap();
        Ticket::submit(TicketId::new(), submission(name), created).unwrap()
    }

    fn apply(ticket: &mut Ticket, cmd: TicketCommand) {
        for e in ticket.handle(&cmd).unwrap() {
            ticket.apply(&e);
        }
    }

    fn given(name: &str, secs: i64) -> Ticket {
        let mut t = ticket_at(name, secs);
        apply(&mut t, TicketCommand::RecordPaymentProof { proof: "memory://p".into() });
        apply(&mut t, TicketCommand::VerifyPayment { allow_legacy_stage1: false });
        apply(&mut t, TicketCommand::MarkGiven { ticket_number: format!("T-{secs}") });
        t
    }

    #[tokio::test]
    async fn save_is_compare_and_swap() {
        let store = InMemoryTicketStore::new();
        let mut t = store.insert(ticket_at("Asha", 0)).await.unwrap();
        assert_eq!(t.version, 1);

        apply(&mut t, TicketCommand::ToggleEntry);
        let v = store.save(&t, ExpectedVersion::Exact(1)).await.unwrap();
        assert_eq!(v, 2);

        let err = store.save(&t, ExpectedVersion::Exact(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }

    #[tokio::test]
    async fn save_rejects_invariant_violations() {
        let store = InMemoryTicketStore::new();
        let mut t = store.insert(ticket_at("Asha", 0)).await.unwrap();
        t.ticket_given = true;
        t.ticket_number = Some("T-1".into());

        let err = store.save(&t, ExpectedVersion::Any).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        let stored = store.get(t.id).await.unwrap().unwrap();
        assert!(!stored.ticket_given);
    }

    #[tokio::test]
    async fn list_is_newest_first_with_total() {
        let store = InMemoryTicketStore::new();
        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            store.insert(ticket_at(name, i as i64)).await.unwrap();
        }

        let page = store.list(Pagination::new(Some(1), Some(2))).await.unwrap();
        assert_eq!(page.total, 3);
        let names: Vec<_> = page.tickets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["C", "B"]);

        let page = store.list(Pagination::new(Some(2), Some(2))).await.unwrap();
        assert_eq!(page.tickets.len(), 1);
        assert_eq!(page.tickets[0].name, "A");
    }

    #[tokio::test]
    async fn search_matches_name_email_or_roll_ignoring_case() {
        let store = InMemoryTicketStore::new();
        let mut meera = submission("Meera");
        meera.roll_number = "20CS041".into();
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        store
            .insert(Ticket::submit(TicketId::new(), meera, created).unwrap())
            .await
            .unwrap();
        store.insert(ticket_at("Ameer", 1)).await.unwrap();
        store.insert(ticket_at("Kiran", 2)).await.unwrap();

        let page = store.search("MEER", Pagination::default()).await.unwrap();
        let names: Vec<_> = page.tickets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Ameer", "Meera"]);
        assert_eq!(page.total, 2);

        let by_roll = store.search(" 20cs ", Pagination::default()).await.unwrap();
        assert_eq!(by_roll.tickets.len(), 1);
        assert_eq!(by_roll.tickets[0].name, "Meera");

        let by_email = store.search("kiran@", Pagination::default()).await.unwrap();
        assert_eq!(by_email.total, 1);

        let paged = store.search("meer", Pagination::new(Some(2), Some(1))).await.unwrap();
        assert_eq!(paged.total, 2);
        assert_eq!(paged.tickets[0].name, "Meera");

        assert_eq!(store.search("nobody", Pagination::default()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn template_append_is_conditional() {
        let store = InMemoryTicketStore::new();
        let t = store.insert(given("A", 0)).await.unwrap();
        store.insert(ticket_at("B", 1)).await.unwrap();
        let template = TemplateId::new();

        let waiting = store.awaiting_template(template).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, t.id);

        assert!(store.record_template_sent(t.id, template, Utc::now()).await.unwrap());
        assert!(!store.record_template_sent(t.id, template, Utc::now()).await.unwrap());
        assert!(store.awaiting_template(template).await.unwrap().is_empty());

        let stored = store.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.templates_sent.len(), 1);
        assert!(stored.last_email_sent_at.is_some());
    }

    #[tokio::test]
    async fn stats_count_each_flag() {
        let store = InMemoryTicketStore::new();
        store.insert(given("A", 0)).await.unwrap();
        store.insert(ticket_at("B", 1)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            TicketStats {
                total_tickets: 2,
                stage2: 1,
                verified_payments: 1,
                given_tickets: 1,
                entries_marked: 0,
            }
        );
    }
}
