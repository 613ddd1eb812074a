use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use outreach_campaigns::{CampaignCounters, FlagChange, TrackingEvent, TrackingEventType, TrackingId};
use outreach_core::CampaignId;
use outreach_events::{EventEnvelope, ProjectionRunner};

use super::log::TrackingLog;
use super::projection::CampaignStatsProjection;
use super::TrackingError;
use crate::repository::{CampaignStore, RecipientStore};

/// What a successful `record` did.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub envelope: EventEnvelope<TrackingEvent>,
    /// `AlreadySet` for a replay: the event is logged, counters are unchanged.
    pub change: FlagChange,
}

/// Stored campaign counters compared against the tracking log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub campaign_id: CampaignId,
    pub stored: CampaignCounters,
    pub derived: CampaignCounters,
    pub last_sequence: u64,
    pub consistent: bool,
}

/// Appends tracking events and applies them to recipient flags and
/// campaign counters.
pub struct TrackingRecorder {
    log: Arc<dyn TrackingLog>,
    recipients: Arc<dyn RecipientStore>,
    campaigns: Arc<dyn CampaignStore>,
}

impl TrackingRecorder {
    pub fn new(
        log: Arc<dyn TrackingLog>,
        recipients: Arc<dyn RecipientStore>,
        campaigns: Arc<dyn CampaignStore>,
    ) -> Self {
        Self {
            log,
            recipients,
            campaigns,
        }
    }

    /// Append the event, then set the recipient flag. The campaign counter
    /// moves only when the flag was newly set, so replays count once.
    pub async fn record(&self, event: TrackingEvent) -> Result<Recorded, TrackingError> {
        let recipient = self
            .recipients
            .get_recipient(event.recipient_id)
            .await?
            .ok_or_else(|| TrackingError::UnknownRecipient(event.recipient_id.to_string()))?;

        if recipient.campaign_id != event.campaign_id {
            return Err(TrackingError::CampaignMismatch {
                recipient_id: recipient.id,
                campaign_id: event.campaign_id,
            });
        }
        if !recipient.can_record(event.event_type) {
            return Err(TrackingError::Rejected {
                recipient_id: recipient.id,
                event_type: event.event_type,
            });
        }

        let event_type = event.event_type;
        let occurred_at = event.occurred_at;
        let reason = event.reason().map(str::to_string);

        let envelope = self.log.append(event).await?;
        let change = self
            .recipients
            .mark_recipient(recipient.id, event_type, occurred_at, reason.as_deref())
            .await?;

        match change {
            FlagChange::Set => debug!(
                recipient_id = %recipient.id,
                event_type = %event_type,
                sequence = envelope.sequence_number(),
                "tracking event recorded"
            ),
            FlagChange::AlreadySet => debug!(
                recipient_id = %recipient.id,
                event_type = %event_type,
                "tracking event replayed; flag already set"
            ),
            FlagChange::Rejected => warn!(
                recipient_id = %recipient.id,
                event_type = %event_type,
                "recipient bounced before the event was applied"
            ),
        }

        Ok(Recorded { envelope, change })
    }

    /// Record an event for the recipient that owns `tracking_id`.
    pub async fn record_by_tracking_id(
        &self,
        tracking_id: &str,
        event_type: TrackingEventType,
        metadata: JsonValue,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Recorded, TrackingError> {
        let parsed: TrackingId = tracking_id
            .parse()
            .map_err(|_| TrackingError::UnknownRecipient(tracking_id.to_string()))?;
        let recipient = self
            .recipients
            .find_by_tracking_id(&parsed)
            .await?
            .ok_or_else(|| TrackingError::UnknownRecipient(tracking_id.to_string()))?;

        let event = TrackingEvent::new(recipient.campaign_id, recipient.id, event_type, now)
            .with_metadata(metadata)
            .with_client(ip_address, user_agent);
        self.record(event).await
    }

    /// Rebuild counters from the log and compare them with the stored ones.
    pub async fn reconcile(&self, campaign_id: CampaignId) -> Result<Reconciliation, TrackingError> {
        let stored = self.campaigns.campaign_counters(campaign_id).await?;
        let history = self.log.load_campaign(campaign_id).await?;

        let (projection, cursor) = ProjectionRunner::rebuild(
            campaign_id,
            CampaignStatsProjection::default,
            history.iter(),
        )?;
        let derived = projection.counters();

        let consistent = stored == derived;
        if !consistent {
            warn!(%campaign_id, ?stored, ?derived, "campaign counters drifted from tracking log");
        }

        Ok(Reconciliation {
            campaign_id,
            stored,
            derived,
            last_sequence: cursor.last_sequence_number(),
            consistent,
        })
    }
}

#[cfg(test)]
mod tests {
    use outreach_campaigns::{Campaign, CampaignCommand, CreateCampaign, Lead, LeadEmail, LeadFilter, Recipient};
    use outreach_core::{Aggregate, LeadId, RecipientId, TemplateId};

    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::tracking::InMemoryTrackingLog;

    struct Fixture {
        recorder: TrackingRecorder,
        repo: Arc<InMemoryRepository>,
        campaign_id: CampaignId,
        recipient: Recipient,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let log = Arc::new(InMemoryTrackingLog::new());

        let campaign_id = CampaignId::new();
        let mut campaign = Campaign::empty(campaign_id);
        campaign
            .execute(&CampaignCommand::Create(CreateCampaign {
                campaign_id,
                name: "spring".into(),
                template_id: TemplateId::new(),
                subject: None,
                target_filter: LeadFilter::default(),
                scheduled_at: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        repo.insert_campaign(&campaign.snapshot().unwrap()).await.unwrap();

        let lead = Lead {
            id: LeadId::new(),
            company_name: Some("Acme".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            industry: None,
            city: None,
            state: None,
            country: None,
            company_size: None,
            status: None,
            source: None,
            tags: vec![],
            quality_score: None,
            emails: vec![LeadEmail {
                address: "ada@acme.test".into(),
                is_primary: true,
                is_validated: true,
            }],
        };
        let recipient = Recipient::snapshot(campaign_id, &lead, Utc::now()).unwrap();
        repo.insert_recipients(vec![recipient.clone()]).await.unwrap();

        Fixture {
            recorder: TrackingRecorder::new(log, repo.clone(), repo.clone()),
            repo,
            campaign_id,
            recipient,
        }
    }

    fn event(f: &Fixture, event_type: TrackingEventType) -> TrackingEvent {
        TrackingEvent::new(f.campaign_id, f.recipient.id, event_type, Utc::now())
    }

    #[tokio::test]
    async fn replayed_open_counts_once() {
        let f = fixture().await;

        let first = f.recorder.record(event(&f, TrackingEventType::Opened)).await.unwrap();
        let second = f.recorder.record(event(&f, TrackingEventType::Opened)).await.unwrap();

        assert_eq!(first.change, FlagChange::Set);
        assert_eq!(second.change, FlagChange::AlreadySet);
        assert_eq!(f.repo.campaign_counters(f.campaign_id).await.unwrap().opened, 1);

        let report = f.recorder.reconcile(f.campaign_id).await.unwrap();
        assert!(report.consistent);
        assert_eq!(report.derived.opened, 1);
        assert_eq!(report.last_sequence, second.envelope.sequence_number());
    }

    #[tokio::test]
    async fn bounce_after_send_is_additive() {
        let f = fixture().await;

        f.recorder.record(event(&f, TrackingEventType::Sent)).await.unwrap();
        let bounce = event(&f, TrackingEventType::Bounced)
            .with_metadata(serde_json::json!({ "reason": "mailbox full" }));
        f.recorder.record(bounce).await.unwrap();

        let counters = f.repo.campaign_counters(f.campaign_id).await.unwrap();
        assert_eq!(counters.sent, 1);
        assert_eq!(counters.bounced, 1);

        let stored = f.repo.get_recipient(f.recipient.id).await.unwrap().unwrap();
        assert_eq!(stored.bounce_reason.as_deref(), Some("mailbox full"));
    }

    #[tokio::test]
    async fn send_after_bounce_is_rejected() {
        let f = fixture().await;

        f.recorder.record(event(&f, TrackingEventType::Bounced)).await.unwrap();
        let err = f.recorder.record(event(&f, TrackingEventType::Sent)).await.unwrap_err();

        assert!(matches!(err, TrackingError::Rejected { .. }));
        assert_eq!(f.repo.campaign_counters(f.campaign_id).await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn records_by_tracking_id() {
        let f = fixture().await;

        let recorded = f
            .recorder
            .record_by_tracking_id(
                f.recipient.tracking_id.as_str(),
                TrackingEventType::Clicked,
                JsonValue::Null,
                Some("203.0.113.7".into()),
                Some("curl/8".into()),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(recorded.envelope.payload().recipient_id, f.recipient.id);
        assert_eq!(recorded.envelope.payload().ip_address.as_deref(), Some("203.0.113.7"));

        let err = f
            .recorder
            .record_by_tracking_id("nope", TrackingEventType::Opened, JsonValue::Null, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::UnknownRecipient(_)));
    }

    #[tokio::test]
    async fn unknown_recipient_is_an_error() {
        let f = fixture().await;
        let stray = TrackingEvent::new(f.campaign_id, RecipientId::new(), TrackingEventType::Opened, Utc::now());

        let err = f.recorder.record(stray).await.unwrap_err();
        assert!(matches!(err, TrackingError::UnknownRecipient(_)));
    }
}
