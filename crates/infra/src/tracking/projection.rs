use std::collections::{BTreeSet, HashMap};

use outreach_campaigns::{CampaignCounters, TrackingEvent, TrackingEventType};
use outreach_core::RecipientId;
use outreach_events::{EventEnvelope, Projection};

/// Distinct recipients per event type, folded from a campaign's tracking log.
///
/// Follows the same flag rules as the recipient rows: repeats count once and
/// a send after a bounce is ignored.
#[derive(Debug, Clone, Default)]
pub struct CampaignStatsProjection {
    flags: HashMap<RecipientId, BTreeSet<TrackingEventType>>,
    counters: CampaignCounters,
}

impl CampaignStatsProjection {
    pub fn counters(&self) -> CampaignCounters {
        self.counters
    }

    pub fn recipients_with(&self, event_type: TrackingEventType) -> usize {
        self.flags.values().filter(|f| f.contains(&event_type)).count()
    }
}

impl Projection for CampaignStatsProjection {
    type Ev = TrackingEvent;

    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) {
        let event = envelope.payload();
        let flags = self.flags.entry(event.recipient_id).or_default();

        if event.event_type == TrackingEventType::Sent
            && flags.contains(&TrackingEventType::Bounced)
            && !flags.contains(&TrackingEventType::Sent)
        {
            return;
        }
        if flags.insert(event.event_type) {
            self.counters.increment(event.event_type);
        }
    }
}
