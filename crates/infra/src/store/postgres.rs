//! Postgres-backed ticket, template and analytics stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (check constraint violation) | `23514` | `Rejected` |
//! | Database (other) | any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |
//!
//! The lifecycle invariants are enforced twice: by `Ticket::check_transition`
//! before every write and by CHECK constraints on the table, so rows written
//! by other tools are held to the same rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use ticketflow_core::{DomainError, ExpectedVersion, TemplateId, TicketId};
use ticketflow_tickets::{Stage, Template, TemplateSend, Ticket};

use super::analytics::{AnalyticsSnapshot, AnalyticsStore};
use super::templates::TemplateStore;
use super::tickets::TicketStore;
use super::{Pagination, StoreError, TicketPage, TicketStats};

const TICKET_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id                 UUID PRIMARY KEY,
        name               TEXT NOT NULL,
        email              TEXT NOT NULL,
        roll_number        TEXT NOT NULL,
        contact_number     TEXT NOT NULL,
        degree             TEXT NOT NULL,
        year               TEXT NOT NULL,
        branch             TEXT NOT NULL,
        stage              TEXT NOT NULL CHECK (stage IN ('1', '2')),
        payment_verified   BOOLEAN NOT NULL DEFAULT FALSE,
        ticket_given       BOOLEAN NOT NULL DEFAULT FALSE,
        entry_marked       BOOLEAN NOT NULL DEFAULT FALSE,
        ticket_number      TEXT,
        payment_proof      TEXT,
        ledger_recorded_at TIMESTAMPTZ,
        templates_sent     JSONB NOT NULL DEFAULT '[]'::jsonb,
        last_email_sent_at TIMESTAMPTZ,
        created_at         TIMESTAMPTZ NOT NULL,
        version            BIGINT NOT NULL,
        CONSTRAINT tickets_given_requires_payment
            CHECK (NOT ticket_given OR payment_verified),
        CONSTRAINT tickets_number_iff_given
            CHECK (ticket_given = (ticket_number IS NOT NULL))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS tickets_created_at_idx ON tickets (created_at DESC, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS tickets_templates_sent_idx ON tickets USING GIN (templates_sent)
    "#,
];

const ANALYTICS_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analytics_snapshots (
        id                BIGSERIAL PRIMARY KEY,
        total_tickets     BIGINT NOT NULL,
        stage2            BIGINT NOT NULL,
        verified_payments BIGINT NOT NULL,
        given_tickets     BIGINT NOT NULL,
        entries_marked    BIGINT NOT NULL,
        total_revenue     BIGINT NOT NULL,
        recorded_at       TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS analytics_recorded_at_idx
        ON analytics_snapshots (recorded_at DESC, id DESC)
    "#,
];

const TEMPLATE_SCHEMA: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS templates (
        id         UUID PRIMARY KEY,
        name       TEXT NOT NULL,
        subject    TEXT NOT NULL,
        body       TEXT NOT NULL,
        locked     BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#];

const TICKET_COLUMNS: &str = "id, name, email, roll_number, contact_number, degree, year, branch, \
     stage, payment_verified, ticket_given, entry_marked, ticket_number, payment_proof, \
     ledger_recorded_at, templates_sent, last_email_sent_at, created_at, version";

#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: PgPool,
}

impl PostgresTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in TICKET_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn exists(&self, id: TicketId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM tickets WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    #[instrument(skip(self, ticket), fields(ticket_id = %ticket.id), err)]
    async fn insert(&self, mut ticket: Ticket) -> Result<Ticket, StoreError> {
        ticket.check_invariants()?;
        ticket.version = 1;

        sqlx::query(
            r#"
            INSERT INTO tickets (
                id, name, email, roll_number, contact_number, degree, year, branch,
                stage, payment_verified, ticket_given, entry_marked, ticket_number,
                payment_proof, ledger_recorded_at, templates_sent, last_email_sent_at,
                created_at, version
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            "#,
        )
        .bind(ticket.id.as_uuid())
        .bind(&ticket.name)
        .bind(&ticket.email)
        .bind(&ticket.roll_number)
        .bind(&ticket.contact_number)
        .bind(&ticket.degree)
        .bind(&ticket.year)
        .bind(&ticket.branch)
        .bind(ticket.stage.as_str())
        .bind(ticket.payment_verified)
        .bind(ticket.ticket_given)
        .bind(ticket.entry_marked)
        .bind(ticket.ticket_number.as_deref())
        .bind(ticket.payment_proof.as_deref())
        .bind(ticket.ledger_recorded_at)
        .bind(Json(&ticket.templates_sent))
        .bind(ticket.last_email_sent_at)
        .bind(ticket.created_at)
        .bind(ticket.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(ticket)
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(ticket_from_row).transpose()
    }

    #[instrument(skip(self, ticket), fields(ticket_id = %ticket.id), err)]
    async fn save(&self, ticket: &Ticket, expected: ExpectedVersion) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("save", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(ticket.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?
        .ok_or(StoreError::NotFound)?;

        let stored = ticket_from_row(&row)?;
        if !expected.matches(stored.version) {
            return Err(StoreError::Concurrency(format!(
                "ticket {} is at version {}, expected {expected:?}",
                ticket.id, stored.version
            )));
        }
        stored.check_transition(ticket)?;
        let version = stored.version + 1;

        sqlx::query(
            r#"
            UPDATE tickets SET
                stage = $2,
                payment_verified = $3,
                ticket_given = $4,
                entry_marked = $5,
                ticket_number = $6,
                payment_proof = $7,
                ledger_recorded_at = $8,
                templates_sent = $9,
                last_email_sent_at = $10,
                version = $11
            WHERE id = $1
            "#,
        )
        .bind(ticket.id.as_uuid())
        .bind(ticket.stage.as_str())
        .bind(ticket.payment_verified)
        .bind(ticket.ticket_given)
        .bind(ticket.entry_marked)
        .bind(ticket.ticket_number.as_deref())
        .bind(ticket.payment_proof.as_deref())
        .bind(ticket.ledger_recorded_at)
        .bind(Json(&ticket.templates_sent))
        .bind(ticket.last_email_sent_at)
        .bind(version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("save", e))?;
        Ok(version)
    }

    async fn list(&self, page: Pagination) -> Result<TicketPage, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM tickets")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("list", e))?;

        Ok(TicketPage {
            tickets: rows.iter().map(ticket_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            limit: page.limit,
            total: total.max(0) as u64,
        })
    }

    async fn search(&self, query: &str, page: Pagination) -> Result<TicketPage, StoreError> {
        const MATCHES: &str = "name ILIKE $1 OR email ILIKE $1 OR roll_number ILIKE $1";
        let pattern = format!("%{}%", escape_like(query.trim()));

        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE {MATCHES} \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(&pattern)
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("search", e))?;

        let total: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS total FROM tickets WHERE {MATCHES}"
        ))
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await
        .and_then(|row| row.try_get("total"))
        .map_err(|e| map_sqlx_error("search", e))?;

        Ok(TicketPage {
            tickets: rows.iter().map(ticket_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            limit: page.limit,
            total: total.max(0) as u64,
        })
    }

    async fn awaiting_template(&self, template_id: TemplateId) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TICKET_COLUMNS} FROM tickets
            WHERE ticket_given AND NOT (templates_sent @> $1)
            ORDER BY created_at, id
            "#
        ))
        .bind(containment_filter(template_id))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("awaiting_template", e))?;

        rows.iter().map(ticket_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn record_template_sent(
        &self,
        id: TicketId,
        template_id: TemplateId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let entry = Json(vec![TemplateSend {
            template_id,
            sent_at,
        }]);

        let result = sqlx::query(
            r#"
            UPDATE tickets SET
                templates_sent = templates_sent || $2,
                last_email_sent_at = $3,
                version = version + 1
            WHERE id = $1 AND NOT (templates_sent @> $4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(entry)
        .bind(sent_at)
        .bind(containment_filter(template_id))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_template_sent", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn stats(&self) -> Result<TicketStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)                                 AS total_tickets,
                COUNT(*) FILTER (WHERE stage = '2')      AS stage2,
                COUNT(*) FILTER (WHERE payment_verified) AS verified_payments,
                COUNT(*) FILTER (WHERE ticket_given)     AS given_tickets,
                COUNT(*) FILTER (WHERE entry_marked)     AS entries_marked
            FROM tickets
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let n: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(n.max(0) as u64)
        };

        Ok(TicketStats {
            total_tickets: count("total_tickets")?,
            stage2: count("stage2")?,
            verified_payments: count("verified_payments")?,
            given_tickets: count("given_tickets")?,
            entries_marked: count("entries_marked")?,
        })
    }
}

/// Treat `%`, `_` and backslash in user input literally under `ILIKE`.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `[{"template_id": ..}]`, matched with `@>` against `templates_sent`.
fn containment_filter(template_id: TemplateId) -> Json<serde_json::Value> {
    Json(serde_json::json!([{ "template_id": template_id }]))
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode ticket row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let stage: String = row.try_get("stage").map_err(decode)?;
    let Json(templates_sent): Json<Vec<TemplateSend>> =
        row.try_get("templates_sent").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(Ticket {
        id: TicketId::from_uuid(id),
        name: row.try_get("name").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        roll_number: row.try_get("roll_number").map_err(decode)?,
        contact_number: row.try_get("contact_number").map_err(decode)?,
        degree: row.try_get("degree").map_err(decode)?,
        year: row.try_get("year").map_err(decode)?,
        branch: row.try_get("branch").map_err(decode)?,
        stage: stage
            .parse::<Stage>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        payment_verified: row.try_get("payment_verified").map_err(decode)?,
        ticket_given: row.try_get("ticket_given").map_err(decode)?,
        entry_marked: row.try_get("entry_marked").map_err(decode)?,
        ticket_number: row.try_get("ticket_number").map_err(decode)?,
        payment_proof: row.try_get("payment_proof").map_err(decode)?,
        ledger_recorded_at: row.try_get("ledger_recorded_at").map_err(decode)?,
        templates_sent,
        last_email_sent_at: row.try_get("last_email_sent_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        version: version.max(0) as u64,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresTemplateStore {
    pool: PgPool,
}

impl PostgresTemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in TEMPLATE_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for PostgresTemplateStore {
    async fn insert(&self, template: Template) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, subject, body, locked, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(template.id.as_uuid())
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(template.locked)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_template", e))?;
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, subject, body, locked, created_at FROM templates WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_template", e))?;

        row.as_ref().map(template_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Template>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, subject, body, locked, created_at FROM templates ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_templates", e))?;

        rows.iter().map(template_from_row).collect()
    }

    async fn update(&self, template: &Template) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE templates SET subject = $2, body = $3 WHERE id = $1 AND NOT locked",
        )
        .bind(template.id.as_uuid())
        .bind(&template.subject)
        .bind(&template.body)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_template", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(template.id).await? {
            Some(_) => Err(DomainError::conflict("template is locked").into()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn lock(&self, id: TemplateId) -> Result<Template, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE templates SET locked = TRUE WHERE id = $1
            RETURNING id, name, subject, body, locked, created_at
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_template", e))?
        .ok_or(StoreError::NotFound)?;

        template_from_row(&row)
    }
}

fn template_from_row(row: &PgRow) -> Result<Template, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode template row: {e}"));
    let id: Uuid = row.try_get("id").map_err(decode)?;

    Ok(Template {
        id: TemplateId::from_uuid(id),
        name: row.try_get("name").map_err(decode)?,
        subject: row.try_get("subject").map_err(decode)?,
        body: row.try_get("body").map_err(decode)?,
        locked: row.try_get("locked").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresAnalyticsStore {
    pool: PgPool,
}

impl PostgresAnalyticsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in ANALYTICS_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for PostgresAnalyticsStore {
    #[instrument(skip(self, snapshot), fields(recorded_at = %snapshot.recorded_at), err)]
    async fn save(&self, snapshot: &AnalyticsSnapshot) -> Result<(), StoreError> {
        let signed = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO analytics_snapshots (
                total_tickets, stage2, verified_payments, given_tickets,
                entries_marked, total_revenue, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(signed(snapshot.stats.total_tickets))
        .bind(signed(snapshot.stats.stage2))
        .bind(signed(snapshot.stats.verified_payments))
        .bind(signed(snapshot.stats.given_tickets))
        .bind(signed(snapshot.stats.entries_marked))
        .bind(signed(snapshot.total_revenue))
        .bind(snapshot.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_analytics", e))?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<AnalyticsSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT total_tickets, stage2, verified_payments, given_tickets,
                   entries_marked, total_revenue, recorded_at
            FROM analytics_snapshots
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_analytics", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode =
            |e: sqlx::Error| StoreError::Backend(format!("failed to decode analytics row: {e}"));
        let count = |column: &str| -> Result<u64, StoreError> {
            let n: i64 = row.try_get(column).map_err(decode)?;
            Ok(n.max(0) as u64)
        };

        Ok(Some(AnalyticsSnapshot {
            stats: TicketStats {
                total_tickets: count("total_tickets")?,
                stage2: count("stage2")?,
                verified_payments: count("verified_payments")?,
                given_tickets: count("given_tickets")?,
                entries_marked: count("entries_marked")?,
            },
            total_revenue: count("total_revenue")?,
            recorded_at: row.try_get("recorded_at").map_err(decode)?,
        }))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23514") => StoreError::Rejected(DomainError::invariant(msg)),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
