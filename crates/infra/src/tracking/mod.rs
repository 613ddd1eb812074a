//! Tracking: the append-only event log, the recorder that applies events to
//! recipients and counters, and the projection used for reconciliation.

pub mod log;
pub mod postgres;
pub mod projection;
pub mod recorder;

use outreach_campaigns::TrackingEventType;
use outreach_core::{CampaignId, EventId, RecipientId};
use outreach_events::ProjectionError;

use crate::repository::RepositoryError;

pub use log::{InMemoryTrackingLog, TrackingLog};
pub use postgres::PostgresTrackingLog;
pub use projection::CampaignStatsProjection;
pub use recorder::{Reconciliation, Recorded, TrackingRecorder};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("recipient {recipient_id} does not belong to campaign {campaign_id}")]
    CampaignMismatch {
        recipient_id: RecipientId,
        campaign_id: CampaignId,
    },
    #[error("{event_type} rejected for recipient {recipient_id}")]
    Rejected {
        recipient_id: RecipientId,
        event_type: TrackingEventType,
    },
    #[error("event already recorded: {0}")]
    DuplicateEvent(EventId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<std::sync::PoisonError<T>> for TrackingError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        TrackingError::Storage("tracking log lock poisoned".to_string())
    }
}
