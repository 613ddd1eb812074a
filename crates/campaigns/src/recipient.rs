//! Campaign recipients: immutable lead snapshots with cumulative delivery flags.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use outreach_core::{CampaignId, DomainError, LeadId, RecipientId};

use crate::lead::Lead;
use crate::tracking::TrackingEventType;

/// Opaque per-recipient token embedded in tracking links (32 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    /// Generate a random tracking id (128 bits of entropy).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrackingId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(DomainError::invalid_id(format!("TrackingId: {s}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Headline status derived from the cumulative flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
}

/// Result of setting a delivery flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagChange {
    /// The flag was unset and is now set.
    Set,
    /// The flag was already set; nothing changed.
    AlreadySet,
    /// The transition is not allowed (a send after a bounce).
    Rejected,
}

/// A campaign-scoped snapshot of a lead.
///
/// Name, company and address are copied at enqueue time and never refreshed,
/// so later edits to the lead do not rewrite delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub city: Option<String>,
    pub tracking_id: TrackingId,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub bounce_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    /// Snapshot a lead for a campaign. Returns `None` when the lead has no usable address.
    pub fn snapshot(campaign_id: CampaignId, lead: &Lead, now: DateTime<Utc>) -> Option<Self> {
        let email = lead.preferred_email()?;
        Some(Self {
            id: RecipientId::new(),
            campaign_id,
            lead_id: lead.id,
            email: email.address.trim().to_string(),
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            company_name: lead.company_name.clone(),
            industry: lead.industry.clone(),
            city: lead.city.clone(),
            tracking_id: TrackingId::generate(),
            sent_at: None,
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            bounced_at: None,
            bounce_reason: None,
            created_at: now,
        })
    }

    pub fn status(&self) -> RecipientStatus {
        if self.bounced_at.is_some() {
            RecipientStatus::Bounced
        } else if self.replied_at.is_some() {
            RecipientStatus::Replied
        } else if self.clicked_at.is_some() {
            RecipientStatus::Clicked
        } else if self.opened_at.is_some() {
            RecipientStatus::Opened
        } else if self.sent_at.is_some() {
            RecipientStatus::Sent
        } else {
            RecipientStatus::Pending
        }
    }

    pub fn is_bounced(&self) -> bool {
        self.bounced_at.is_some()
    }

    pub fn flag(&self, event_type: TrackingEventType) -> Option<DateTime<Utc>> {
        match event_type {
            TrackingEventType::Sent => self.sent_at,
            TrackingEventType::Opened => self.opened_at,
            TrackingEventType::Clicked => self.clicked_at,
            TrackingEventType::Replied => self.replied_at,
            TrackingEventType::Bounced => self.bounced_at,
        }
    }

    /// Whether a flag may be set from the current state.
    ///
    /// Flags are cumulative. The only forbidden move is a new send once the
    /// recipient has bounced.
    pub fn can_record(&self, event_type: TrackingEventType) -> bool {
        !(event_type == TrackingEventType::Sent && self.is_bounced() && self.sent_at.is_none())
    }

    /// Set a delivery flag. Setting an already-set flag is a no-op.
    pub fn mark(
        &mut self,
        event_type: TrackingEventType,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> FlagChange {
        if self.flag(event_type).is_some() {
            return FlagChange::AlreadySet;
        }
        if !self.can_record(event_type) {
            return FlagChange::Rejected;
        }

        let slot = match event_type {
            TrackingEventType::Sent => &mut self.sent_at,
            TrackingEventType::Opened => &mut self.opened_at,
            TrackingEventType::Clicked => &mut self.clicked_at,
            TrackingEventType::Replied => &mut self.replied_at,
            TrackingEventType::Bounced => {
                self.bounce_reason = reason.map(str::to_string);
                &mut self.bounced_at
            }
        };
        *slot = Some(at);
        FlagChange::Set
    }
}
