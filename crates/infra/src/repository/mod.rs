//! Storage for campaigns, templates, leads and recipients.
//!
//! Campaign lifecycle state is saved with optimistic concurrency; engagement
//! counters are owned by [`RecipientStore::mark_recipient`], which bumps the
//! matching counter in the same atomic step that sets a recipient flag.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outreach_campaigns::{
    CampaignCounters, CampaignSnapshot, CampaignStatus, FlagChange, Lead, LeadFilter, Recipient,
    Template, TrackingEventType, TrackingId,
};
use outreach_core::{CampaignId, ExpectedVersion, RecipientId, TemplateId};

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("{0} already exists")]
    Duplicate(&'static str),
    /// Still referenced by other rows.
    #[error("{0} is in use")]
    InUse(&'static str),
    /// Stored version differs from the expected one.
    #[error("version conflict: expected {expected:?}, found {actual}")]
    Conflict { expected: ExpectedVersion, actual: u64 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }
}

impl<T> From<std::sync::PoisonError<T>> for RepositoryError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        RepositoryError::Storage("repository lock poisoned".to_string())
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: &CampaignSnapshot) -> Result<(), RepositoryError>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<CampaignSnapshot>, RepositoryError>;

    /// Overwrite lifecycle state if the stored version matches `expected`.
    /// Counters are untouched.
    async fn save_campaign(
        &self,
        campaign: &CampaignSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError>;

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignSnapshot>, RepositoryError>;

    async fn campaign_counters(&self, id: CampaignId) -> Result<CampaignCounters, RepositoryError>;

    /// Every campaign with its counters, newest first.
    async fn list_campaigns(&self) -> Result<Vec<(CampaignSnapshot, CampaignCounters)>, RepositoryError>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert_template(&self, template: &Template) -> Result<(), RepositoryError>;

    async fn get_template(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError>;

    /// Newest first.
    async fn list_templates(&self) -> Result<Vec<Template>, RepositoryError>;

    /// Overwrite a stored template. `id` and `created_at` identify the row.
    async fn update_template(&self, template: &Template) -> Result<(), RepositoryError>;

    /// Fails with [`RepositoryError::InUse`] while a campaign references it.
    async fn delete_template(&self, id: TemplateId) -> Result<(), RepositoryError>;
}

/// Read-only view of the lead import pipeline's output.
#[async_trait]
pub trait LeadSource: Send + Sync {
    /// Leads matching the filter, ordered by id.
    async fn find_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError>;
}

#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Insert recipients, keeping any that already exist for the same
    /// (campaign, lead). Returns the stored rows for every input, in input order.
    /// A tracking id clash rejects the whole batch.
    async fn insert_recipients(
        &self,
        recipients: Vec<Recipient>,
    ) -> Result<Vec<Recipient>, RepositoryError>;

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>, RepositoryError>;

    async fn find_by_tracking_id(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<Recipient>, RepositoryError>;

    async fn list_recipients(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>, RepositoryError>;

    /// Set one delivery flag. When the flag is newly set, the campaign's
    /// matching counter is incremented in the same atomic step.
    async fn mark_recipient(
        &self,
        id: RecipientId,
        event_type: TrackingEventType,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<FlagChange, RepositoryError>;
}
