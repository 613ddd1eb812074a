use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{CampaignId, EventId};

/// A stored event together with its stream position.
///
/// Streams are keyed by campaign: every tracking event of a campaign lives in
/// the same stream and `sequence_number` increases monotonically within it.
/// Sequence numbers may have gaps (a shared database sequence), never repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    stream_id: CampaignId,

    /// Monotonically increasing position in the campaign stream.
    sequence_number: u64,

    /// When the log accepted the event.
    recorded_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        stream_id: CampaignId,
        sequence_number: u64,
        recorded_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            sequence_number,
            recorded_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn stream_id(&self) -> CampaignId {
        self.stream_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
