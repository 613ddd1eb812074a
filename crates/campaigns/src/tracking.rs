//! Tracking events: immutable facts about a recipient's delivery lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use outreach_core::{CampaignId, DomainError, EventId, RecipientId};
use outreach_events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventType {
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
}

impl TrackingEventType {
    pub const ALL: [TrackingEventType; 5] = [
        TrackingEventType::Sent,
        TrackingEventType::Opened,
        TrackingEventType::Clicked,
        TrackingEventType::Replied,
        TrackingEventType::Bounced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingEventType::Sent => "sent",
            TrackingEventType::Opened => "opened",
            TrackingEventType::Clicked => "clicked",
            TrackingEventType::Replied => "replied",
            TrackingEventType::Bounced => "bounced",
        }
    }
}

impl core::fmt::Display for TrackingEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingEventType {
    type Err = DomainError;

    /// Accepts both past-tense names and the verb forms delivery webhooks use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" | "send" | "delivered" => Ok(TrackingEventType::Sent),
            "opened" | "open" => Ok(TrackingEventType::Opened),
            "clicked" | "click" => Ok(TrackingEventType::Clicked),
            "replied" | "reply" => Ok(TrackingEventType::Replied),
            "bounced" | "bounce" => Ok(TrackingEventType::Bounced),
            other => Err(DomainError::validation(format!("unknown event type: {other}"))),
        }
    }
}

/// One delivery-lifecycle occurrence for a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub event_id: EventId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub event_type: TrackingEventType,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl TrackingEvent {
    pub fn new(
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        event_type: TrackingEventType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            campaign_id,
            recipient_id,
            event_type,
            occurred_at,
            metadata: JsonValue::Null,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Free-text reason carried in `metadata.reason` (bounce reasons).
    pub fn reason(&self) -> Option<&str> {
        self.metadata.get("reason").and_then(JsonValue::as_str)
    }
}

impl Event for TrackingEvent {
    fn event_type(&self) -> &'static str {
        match self.event_type {
            TrackingEventType::Sent => "campaign.recipient.sent",
            TrackingEventType::Opened => "campaign.recipient.opened",
            TrackingEventType::Clicked => "campaign.recipient.clicked",
            TrackingEventType::Replied => "campaign.recipient.replied",
            TrackingEventType::Bounced => "campaign.recipient.bounced",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_webhook_verbs() {
        assert_eq!("open".parse::<TrackingEventType>().unwrap(), TrackingEventType::Opened);
        assert_eq!(" Bounce ".parse::<TrackingEventType>().unwrap(), TrackingEventType::Bounced);
        assert!("unsubscribed".parse::<TrackingEventType>().is_err());
    }

    #[test]
    fn reason_reads_metadata() {
        let event = TrackingEvent::new(
            CampaignId::new(),
            RecipientId::new(),
            TrackingEventType::Bounced,
            Utc::now(),
        )
        .with_metadata(serde_json::json!({ "reason": "mailbox full" }));

        assert_eq!(event.reason(), Some("mailbox full"));
        assert_eq!(event.event_type(), "campaign.recipient.bounced");
    }
}
