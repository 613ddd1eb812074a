//! Postgres-backed tracking log (`email_tracking`).

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use outreach_campaigns::{TrackingEvent, TrackingEventType};
use outreach_core::{CampaignId, EventId, RecipientId};
use outreach_events::EventEnvelope;

use super::log::TrackingLog;
use super::TrackingError;
use crate::db::{describe, is_unique_violation, non_negative};

const TRACKING_COLUMNS: &str = "sequence_number, event_id, campaign_id, recipient_id, event_type, \
     occurred_at, recorded_at, metadata, ip_address, user_agent";

#[derive(Debug, Clone)]
pub struct PostgresTrackingLog {
    pool: PgPool,
}

impl PostgresTrackingLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackingLog for PostgresTrackingLog {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id, campaign_id = %event.campaign_id, event_type = %event.event_type),
        err
    )]
    async fn append(&self, event: TrackingEvent) -> Result<EventEnvelope<TrackingEvent>, TrackingError> {
        let sql = format!(
            r#"
            INSERT INTO email_tracking
                (event_id, campaign_id, recipient_id, event_type, occurred_at, metadata,
                 ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {TRACKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(event.event_id.as_uuid())
            .bind(event.campaign_id.as_uuid())
            .bind(event.recipient_id.as_uuid())
            .bind(event.event_type.as_str())
            .bind(event.occurred_at)
            .bind(&event.metadata)
            .bind(event.ip_address.as_deref())
            .bind(event.user_agent.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TrackingError::DuplicateEvent(event.event_id)
                } else {
                    map_sqlx_error("append", e)
                }
            })?;
        decode_envelope(&row)
    }

    #[instrument(skip(self), err)]
    async fn load_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<EventEnvelope<TrackingEvent>>, TrackingError> {
        let sql = format!(
            "SELECT {TRACKING_COLUMNS} FROM email_tracking WHERE campaign_id = $1 ORDER BY sequence_number"
        );
        let rows = sqlx::query(&sql)
            .bind(campaign_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_campaign", e))?;
        rows.iter().map(decode_envelope).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TrackingError {
    TrackingError::Storage(describe(operation, &err))
}

fn decode_envelope(row: &PgRow) -> Result<EventEnvelope<TrackingEvent>, TrackingError> {
    let decode = || -> Result<EventEnvelope<TrackingEvent>, sqlx::Error> {
        let event_type: String = row.try_get("event_type")?;
        let event_type: TrackingEventType = event_type
            .parse()
            .map_err(|e: outreach_core::DomainError| sqlx::Error::Decode(e.to_string().into()))?;
        let event = TrackingEvent {
            event_id: EventId::from_uuid(row.try_get("event_id")?),
            campaign_id: CampaignId::from_uuid(row.try_get("campaign_id")?),
            recipient_id: RecipientId::from_uuid(row.try_get("recipient_id")?),
            event_type,
            occurred_at: row.try_get("occurred_at")?,
            metadata: row.try_get("metadata")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
        };
        Ok(EventEnvelope::new(
            event.event_id,
            event.campaign_id,
            non_negative(row.try_get("sequence_number")?, "sequence_number")?,
            row.try_get("recorded_at")?,
            event,
        ))
    };
    decode().map_err(|e| map_sqlx_error("decode_envelope", e))
}
