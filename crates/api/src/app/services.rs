//! Engine wiring: picks in-memory or Postgres stores and builds the
//! orchestrator, recorder, dispatcher and maintenance tasks on top.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{watch, Notify};

use outreach_infra::config::EngineConfig;
use outreach_infra::credentials::{CredentialPool, InMemoryCredentialPool, PostgresCredentialPool};
use outreach_infra::db;
use outreach_infra::dispatcher::{
    Dispatcher, DispatcherHandle, DispatcherStats, MailTransport, TemplateRenderer,
};
use outreach_infra::maintenance::{Maintenance, MaintenanceHandle};
use outreach_infra::orchestrator::CampaignOrchestrator;
use outreach_infra::queue::{InMemoryQueueStore, PostgresQueueStore, QueueStore, RetryPolicy};
use outreach_infra::repository::{
    CampaignStore, InMemoryRepository, LeadSource, PostgresRepository, RecipientStore,
    TemplateStore,
};
use outreach_infra::tracking::{
    InMemoryTrackingLog, PostgresTrackingLog, TrackingLog, TrackingRecorder,
};

/// The storage backends the engine runs on.
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub leads: Arc<dyn LeadSource>,
    pub recipients: Arc<dyn RecipientStore>,
    pub queue: Arc<dyn QueueStore>,
    pub credentials: Arc<dyn CredentialPool>,
    pub log: Arc<dyn TrackingLog>,
}

impl Stores {
    /// In-memory stores (dev/test). The repository is returned so callers
    /// can seed leads, which the engine itself only reads.
    pub fn in_memory(retry: RetryPolicy) -> (Self, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let stores = Self {
            campaigns: repo.clone(),
            templates: repo.clone(),
            leads: repo.clone(),
            recipients: repo.clone(),
            queue: Arc::new(InMemoryQueueStore::new(retry)),
            credentials: Arc::new(InMemoryCredentialPool::new()),
            log: Arc::new(InMemoryTrackingLog::new()),
        };
        (stores, repo)
    }

    pub fn postgres(pool: PgPool, retry: RetryPolicy) -> Self {
        let repo = Arc::new(PostgresRepository::new(pool.clone()));
        Self {
            campaigns: repo.clone(),
            templates: repo.clone(),
            leads: repo.clone(),
            recipients: repo,
            queue: Arc::new(PostgresQueueStore::new(pool.clone(), retry)),
            credentials: Arc::new(PostgresCredentialPool::new(pool.clone())),
            log: Arc::new(PostgresTrackingLog::new(pool)),
        }
    }
}

/// Everything the HTTP handlers and the background tasks share.
pub struct AppServices {
    pub stores: Stores,
    pub orchestrator: Arc<CampaignOrchestrator>,
    pub recorder: Arc<TrackingRecorder>,
    pub dispatcher: Arc<Dispatcher>,
    pub maintenance: Arc<Maintenance>,
    pub config: EngineConfig,
}

/// Background tasks started by [`AppServices::start`].
pub struct RunningEngine {
    pub dispatcher: DispatcherHandle,
    pub maintenance: MaintenanceHandle,
}

impl RunningEngine {
    pub async fn join(self) {
        self.dispatcher.join().await;
        self.maintenance.join().await;
    }
}

impl AppServices {
    pub fn new(stores: Stores, config: EngineConfig, transport: Arc<dyn MailTransport>) -> Self {
        let wake = Arc::new(Notify::new());

        let orchestrator = Arc::new(
            CampaignOrchestrator::new(
                stores.campaigns.clone(),
                stores.templates.clone(),
                stores.leads.clone(),
                stores.recipients.clone(),
                stores.queue.clone(),
                wake.clone(),
            )
            .with_default_priority(config.default_priority),
        );
        let recorder = Arc::new(TrackingRecorder::new(
            stores.log.clone(),
            stores.recipients.clone(),
            stores.campaigns.clone(),
        ));
        let renderer = Arc::new(TemplateRenderer::new(
            stores.templates.clone(),
            config.tracking_base_url.clone(),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(
                stores.queue.clone(),
                stores.credentials.clone(),
                stores.recipients.clone(),
                stores.campaigns.clone(),
                renderer,
                transport,
                recorder.clone(),
            )
            .with_wake(wake)
            .with_send_timeout(config.send_timeout),
        );
        let maintenance = Arc::new(Maintenance::new(
            stores.queue.clone(),
            stores.credentials.clone(),
            orchestrator.clone(),
            config.maintenance.clone(),
        ));

        Self {
            stores,
            orchestrator,
            recorder,
            dispatcher,
            maintenance,
            config,
        }
    }

    pub fn dispatcher_stats(&self) -> Arc<DispatcherStats> {
        self.dispatcher.stats()
    }

    /// Spawn the dispatcher workers and maintenance loops.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> RunningEngine {
        RunningEngine {
            dispatcher: self
                .dispatcher
                .clone()
                .spawn(self.config.dispatcher.clone(), shutdown.clone()),
            maintenance: self.maintenance.clone().spawn(shutdown),
        }
    }
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(
    config: EngineConfig,
    transport: Arc<dyn MailTransport>,
) -> anyhow::Result<AppServices> {
    let stores = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect(url, config.db_max_connections).await?;
            db::ensure_schema(&pool).await?;
            Stores::postgres(pool, config.retry.clone())
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory(config.retry.clone()).0
        }
    };

    Ok(AppServices::new(stores, config, transport))
}
