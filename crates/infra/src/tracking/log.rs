use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use outreach_campaigns::TrackingEvent;
use outreach_core::{CampaignId, EventId};
use outreach_events::EventEnvelope;

use super::TrackingError;

/// Append-only log of tracking events, streamed per campaign.
///
/// Sequence numbers are assigned by the log and increase monotonically;
/// they may have gaps within one campaign's stream.
#[async_trait]
pub trait TrackingLog: Send + Sync {
    /// Append one event. Rejects a second event with the same `event_id`.
    async fn append(&self, event: TrackingEvent) -> Result<EventEnvelope<TrackingEvent>, TrackingError>;

    /// Every event of a campaign, in sequence order.
    async fn load_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<EventEnvelope<TrackingEvent>>, TrackingError>;
}

#[derive(Debug, Default)]
struct LogState {
    next_sequence: u64,
    event_ids: HashSet<EventId>,
    streams: HashMap<CampaignId, Vec<EventEnvelope<TrackingEvent>>>,
}

/// In-memory append-only tracking log.
///
/// Intended for tests/dev. Uses one global sequence, like a database sequence would.
#[derive(Debug, Default)]
pub struct InMemoryTrackingLog {
    state: RwLock<LogState>,
}

impl InMemoryTrackingLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackingLog for InMemoryTrackingLog {
    async fn append(&self, event: TrackingEvent) -> Result<EventEnvelope<TrackingEvent>, TrackingError> {
        let mut state = self.state.write()?;
        if !state.event_ids.insert(event.event_id) {
            return Err(TrackingError::DuplicateEvent(event.event_id));
        }

        state.next_sequence += 1;
        let envelope = EventEnvelope::new(
            event.event_id,
            event.campaign_id,
            state.next_sequence,
            Utc::now(),
            event,
        );
        state
            .streams
            .entry(envelope.stream_id())
            .or_default()
            .push(envelope.clone());
        Ok(envelope)
    }

    async fn load_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<EventEnvelope<TrackingEvent>>, TrackingError> {
        let state = self.state.read()?;
        Ok(state.streams.get(&campaign_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use outreach_campaigns::TrackingEventType;
    use outreach_core::RecipientId;

    use super::*;

    fn event(campaign_id: CampaignId) -> TrackingEvent {
        TrackingEvent::new(campaign_id, RecipientId::new(), TrackingEventType::Opened, Utc::now())
    }

    #[tokio::test]
    async fn sequences_increase_across_streams() {
        let log = InMemoryTrackingLog::new();
        let a = CampaignId::new();
        let b = CampaignId::new();

        let first = log.append(event(a)).await.unwrap();
        let other = log.append(event(b)).await.unwrap();
        let second = log.append(event(a)).await.unwrap();

        assert!(first.sequence_number() < other.sequence_number());
        assert!(other.sequence_number() < second.sequence_number());

        let stream = log.load_campaign(a).await.unwrap();
        assert_eq!(stream.len(), 2);
        assert!(stream.iter().all(|e| e.stream_id() == a));
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected() {
        let log = InMemoryTrackingLog::new();
        let e = event(CampaignId::new());

        log.append(e.clone()).await.unwrap();
        let err = log.append(e.clone()).await.unwrap_err();
        assert!(matches!(err, TrackingError::DuplicateEvent(id) if id == e.event_id));
    }
}
