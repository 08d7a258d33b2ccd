//! Start-up wiring: stores, queue, gateways and the worker pool.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use ticketflow_infra::ServiceConfig;
use ticketflow_infra::cache::{CacheBackend, InMemoryCacheBackend, ListingCache};
use ticketflow_infra::dispatch::TicketDispatcher;
use ticketflow_infra::gateways::{
    DisabledMailer, InMemoryLedger, InMemoryMailer, InMemoryObjectStore, Mailer,
};
use ticketflow_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore, QueueManager};
use ticketflow_infra::service::TicketService;
use ticketflow_infra::store::{
    AnalyticsStore, InMemoryAnalyticsStore, InMemoryTemplateStore, InMemoryTicketStore,
    PostgresAnalyticsStore, PostgresTemplateStore, PostgresTicketStore, TemplateStore, TicketStore,
};
use ticketflow_infra::workers::{
    BulkNotifyWorker, FinalizeWorker, OnboardingNotifyWorker, WorkerPool,
};

pub struct AppServices {
    pub service: TicketService,
    pub pool: WorkerPool,
    pub jobs: Arc<dyn JobStore>,
}

struct Backends {
    tickets: Arc<dyn TicketStore>,
    templates: Arc<dyn TemplateStore>,
    snapshots: Arc<dyn AnalyticsStore>,
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn CacheBackend>,
    mailer: Arc<dyn Mailer>,
}

pub async fn build_services(config: &ServiceConfig) -> anyhow::Result<AppServices> {
    let backends = if config.use_persistent_stores {
        persistent_backends(config).await?
    } else {
        in_memory_backends()
    };

    let listing = ListingCache::new(backends.cache);
    let dispatcher = TicketDispatcher::new(backends.tickets.clone(), listing.clone());
    let queue = Arc::new(
        QueueManager::new(backends.jobs.clone()).with_default_policy(config.retry_policy()),
    );

    let pool = WorkerPool::new(
        FinalizeWorker::new(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryLedger::new()),
            dispatcher.clone(),
            config.finalize_settings(),
        ),
        BulkNotifyWorker::new(backends.tickets, backends.mailer.clone(), listing),
        OnboardingNotifyWorker::new(backends.mailer),
    );

    let service = TicketService::new(
        dispatcher,
        backends.templates,
        queue,
        config.service_settings(),
    )
    .with_analytics_store(backends.snapshots);
    if config.legacy_stage1_verify {
        tracing::warn!("TICKETFLOW_LEGACY_STAGE1_VERIFY is deprecated and will be removed");
    }

    Ok(AppServices {
        service,
        pool,
        jobs: backends.jobs,
    })
}

fn in_memory_backends() -> Backends {
    Backends {
        tickets: Arc::new(InMemoryTicketStore::new()),
        templates: Arc::new(InMemoryTemplateStore::new()),
        snapshots: Arc::new(InMemoryAnalyticsStore::new()),
        jobs: Arc::new(InMemoryJobStore::new()),
        cache: Arc::new(InMemoryCacheBackend::new()),
        mailer: Arc::new(InMemoryMailer::new()),
    }
}

async fn persistent_backends(config: &ServiceConfig) -> anyhow::Result<Backends> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let pg = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let tickets = PostgresTicketStore::new(pg.clone());
    tickets.migrate().await.context("ticket schema migration")?;
    let templates = PostgresTemplateStore::new(pg.clone());
    templates.migrate().await.context("template schema migration")?;
    let snapshots = PostgresAnalyticsStore::new(pg.clone());
    snapshots.migrate().await.context("analytics schema migration")?;
    let jobs = PostgresJobStore::new(pg);
    jobs.migrate().await.context("job schema migration")?;

    Ok(Backends {
        tickets: Arc::new(tickets),
        templates: Arc::new(templates),
        snapshots: Arc::new(snapshots),
        jobs: Arc::new(jobs),
        cache: cache_backend(config)?,
        mailer: Arc::new(DisabledMailer),
    })
}

#[cfg(feature = "redis")]
fn cache_backend(config: &ServiceConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    let backend = ticketflow_infra::cache::RedisCacheBackend::new(&config.redis_url)
        .context("failed to create Redis cache backend")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
fn cache_backend(config: &ServiceConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    tracing::warn!(
        redis_url = %config.redis_url,
        "redis feature not enabled, falling back to in-memory listing cache"
    );
    Ok(Arc::new(InMemoryCacheBackend::new()))
}
