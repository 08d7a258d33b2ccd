use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ticketflow_core::{DomainError, DomainResult, TemplateId};

use crate::ticket::Ticket;

pub const NAME_PLACEHOLDER: &str = "{{name}}";
pub const TICKET_NUMBER_PLACEHOLDER: &str = "{{ticket_number}}";

const NAME_FALLBACK: &str = "Guest";
const TICKET_NUMBER_FALLBACK: &str = "N/A";

/// Reusable email body with placeholders.
///
/// A template is locked once a bulk send has been enqueued for it, so every
/// recipient of that send sees the same content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub locked: bool,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        id: TemplateId,
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let name = name.into();
        let subject = subject.into();
        let body = body.into();
        check_content(&name, &subject, &body)?;

        Ok(Self {
            id,
            name,
            subject,
            body,
            locked: false,
            created_at,
        })
    }

    pub fn revise(
        &mut self,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> DomainResult<()> {
        if self.locked {
            return Err(DomainError::conflict("template is locked"));
        }
        let subject = subject.into();
        let body = body.into();
        check_content(&self.name, &subject, &body)?;
        self.subject = subject;
        self.body = body;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn render_for(&self, ticket: &Ticket) -> String {
        render_for(&self.body, ticket)
    }
}

fn check_content(name: &str, subject: &str, body: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("template name is required"));
    }
    if subject.trim().is_empty() {
        return Err(DomainError::validation("template subject is required"));
    }
    if body.trim().is_empty() {
        return Err(DomainError::validation("template body is required"));
    }
    Ok(())
}

/// Substitute every placeholder occurrence, falling back for missing values.
pub fn render(body: &str, name: Option<&str>, ticket_number: Option<&str>) -> String {
    let name = name.filter(|n| !n.trim().is_empty()).unwrap_or(NAME_FALLBACK);
    let number = ticket_number
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(TICKET_NUMBER_FALLBACK);

    body.replace(NAME_PLACEHOLDER, name)
        .replace(TICKET_NUMBER_PLACEHOLDER, number)
}

pub fn render_for(body: &str, ticket: &Ticket) -> String {
    render(body, Some(ticket.name.as_str()), ticket.ticket_number.as_deref())
}
