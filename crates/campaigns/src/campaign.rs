use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{
    Aggregate, AggregateRoot, CampaignId, DomainError, StateMachine, TemplateId,
};
use outreach_events::Event;

use crate::lead::LeadFilter;
use crate::tracking::TrackingEventType;

/// Campaign lifecycle.
///
/// `draft -> scheduled -> running -> completed`, or `cancelled` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown campaign status: {other}"))),
        }
    }
}

impl StateMachine for CampaignStatus {
    const ENTITY: &'static str = "campaign";

    fn can_transition_to(self, next: Self) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Running)
                | (Running, Completed)
                | (Draft, Cancelled)
                | (Scheduled, Cancelled)
                | (Running, Cancelled)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

/// Per-campaign engagement counters.
///
/// Each counter is the number of distinct recipients with the matching flag
/// set, so they can be rebuilt from the tracking log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
    pub bounced: u64,
}

impl CampaignCounters {
    pub fn get(&self, event_type: TrackingEventType) -> u64 {
        match event_type {
            TrackingEventType::Sent => self.sent,
            TrackingEventType::Opened => self.opened,
            TrackingEventType::Clicked => self.clicked,
            TrackingEventType::Replied => self.replied,
            TrackingEventType::Bounced => self.bounced,
        }
    }

    pub fn increment(&mut self, event_type: TrackingEventType) {
        let slot = match event_type {
            TrackingEventType::Sent => &mut self.sent,
            TrackingEventType::Opened => &mut self.opened,
            TrackingEventType::Clicked => &mut self.clicked,
            TrackingEventType::Replied => &mut self.replied,
            TrackingEventType::Bounced => &mut self.bounced,
        };
        *slot += 1;
    }

    /// Share of `total` recipients with this event, in percent, one decimal.
    pub fn rate(&self, event_type: TrackingEventType, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let pct = self.get(event_type) as f64 * 100.0 / total as f64;
        (pct * 10.0).round() / 10.0
    }
}

/// Aggregate root: Campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
    id: CampaignId,
    name: String,
    template_id: Option<TemplateId>,
    subject: Option<String>,
    target_filter: LeadFilter,
    status: CampaignStatus,
    total_recipients: u64,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

/// Flat, serializable form of a [`Campaign`] used by stores and the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub id: CampaignId,
    pub name: String,
    pub template_id: Option<TemplateId>,
    pub subject: Option<String>,
    pub target_filter: LeadFilter,
    pub status: CampaignStatus,
    pub total_recipients: u64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Campaign {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: CampaignId) -> Self {
        Self {
            id,
            name: String::new(),
            template_id: None,
            subject: None,
            target_filter: LeadFilter::default(),
            status: CampaignStatus::Draft,
            total_recipients: 0,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    /// Rehydrate from persisted state.
    pub fn from_snapshot(s: CampaignSnapshot) -> Self {
        Self {
            id: s.id,
            name: s.name,
            template_id: s.template_id,
            subject: s.subject,
            target_filter: s.target_filter,
            status: s.status,
            total_recipients: s.total_recipients,
            scheduled_at: s.scheduled_at,
            started_at: s.started_at,
            completed_at: s.completed_at,
            cancelled_at: s.cancelled_at,
            created_at: Some(s.created_at),
            version: s.version,
            created: true,
        }
    }

    /// Persistable state. Returns `None` before the aggregate has been created.
    pub fn snapshot(&self) -> Option<CampaignSnapshot> {
        let created_at = self.created_at.filter(|_| self.created)?;
        Some(CampaignSnapshot {
            id: self.id,
            name: self.name.clone(),
            template_id: self.template_id,
            subject: self.subject.clone(),
            target_filter: self.target_filter.clone(),
            status: self.status,
            total_recipients: self.total_recipients,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            created_at,
            version: self.version,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template_id(&self) -> Option<TemplateId> {
        self.template_id
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn target_filter(&self) -> &LeadFilter {
        &self.target_filter
    }

    pub fn status(&self) -> CampaignStatus {
        self.status
    }

    pub fn total_recipients(&self) -> u64 {
        self.total_recipients
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CampaignStatus::Cancelled
    }
}

impl AggregateRoot for Campaign {
    type Id = CampaignId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub campaign_id: CampaignId,
    pub name: String,
    pub template_id: TemplateId,
    pub subject: Option<String>,
    pub target_filter: LeadFilter,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCampaign {
    pub occurred_at: DateTime<Utc>,
}

/// Move a scheduled campaign to `running` once its recipients are enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCampaign {
    pub total_recipients: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteCampaign {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCampaign {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CampaignCommand {
    Create(CreateCampaign),
    Schedule(ScheduleCampaign),
    Start(StartCampaign),
    Complete(CompleteCampaign),
    Cancel(CancelCampaign),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CampaignEvent {
    Created(CreateCampaign),
    Scheduled { occurred_at: DateTime<Utc> },
    Started { total_recipients: u64, occurred_at: DateTime<Utc> },
    Completed { occurred_at: DateTime<Utc> },
    Cancelled { from: CampaignStatus, occurred_at: DateTime<Utc> },
}

impl Event for CampaignEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CampaignEvent::Created(_) => "campaign.created",
            CampaignEvent::Scheduled { .. } => "campaign.scheduled",
            CampaignEvent::Started { .. } => "campaign.started",
            CampaignEvent::Completed { .. } => "campaign.completed",
            CampaignEvent::Cancelled { .. } => "campaign.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CampaignEvent::Created(e) => e.occurred_at,
            CampaignEvent::Scheduled { occurred_at }
            | CampaignEvent::Started { occurred_at, .. }
            | CampaignEvent::Completed { occurred_at }
            | CampaignEvent::Cancelled { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Campaign {
    type Command = CampaignCommand;
    type Event = CampaignEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CampaignEvent::Created(e) => {
                self.id = e.campaign_id;
                self.name = e.name.clone();
                self.template_id = Some(e.template_id);
                self.subject = e.subject.clone();
                self.target_filter = e.target_filter.clone();
                self.scheduled_at = e.scheduled_at;
                self.status = CampaignStatus::Draft;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            CampaignEvent::Scheduled { .. } => {
                self.status = CampaignStatus::Scheduled;
            }
            CampaignEvent::Started {
                total_recipients,
                occurred_at,
            } => {
                self.status = CampaignStatus::Running;
                self.total_recipients = *total_recipients;
                self.started_at = Some(*occurred_at);
            }
            CampaignEvent::Completed { occurred_at } => {
                self.status = CampaignStatus::Completed;
                self.completed_at = Some(*occurred_at);
            }
            CampaignEvent::Cancelled { occurred_at, .. } => {
                self.status = CampaignStatus::Cancelled;
                self.cancelled_at = Some(*occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !self.created && !matches!(command, CampaignCommand::Create(_)) {
            return Err(DomainError::not_found());
        }

        match command {
            CampaignCommand::Create(cmd) => self.handle_create(cmd),
            CampaignCommand::Schedule(cmd) => {
                self.status.transition(CampaignStatus::Scheduled)?;
                Ok(vec![CampaignEvent::Scheduled {
                    occurred_at: cmd.occurred_at,
                }])
            }
            CampaignCommand::Start(cmd) => {
                self.status.transition(CampaignStatus::Running)?;
                if cmd.total_recipients == 0 {
                    return Err(DomainError::validation(
                        "cannot start a campaign without recipients",
                    ));
                }
                Ok(vec![CampaignEvent::Started {
                    total_recipients: cmd.total_recipients,
                    occurred_at: cmd.occurred_at,
                }])
            }
            CampaignCommand::Complete(cmd) => {
                self.status.transition(CampaignStatus::Completed)?;
                Ok(vec![CampaignEvent::Completed {
                    occurred_at: cmd.occurred_at,
                }])
            }
            CampaignCommand::Cancel(cmd) => {
                // Cancelling twice is a no-op.
                if self.is_cancelled() {
                    return Ok(vec![]);
                }
                self.status.transition(CampaignStatus::Cancelled)?;
                Ok(vec![CampaignEvent::Cancelled {
                    from: self.status,
                    occurred_at: cmd.occurred_at,
                }])
            }
        }
    }
}

impl Campaign {
    fn handle_create(&self, cmd: &CreateCampaign) -> Result<Vec<CampaignEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("campaign already exists"));
        }
        if self.id != cmd.campaign_id {
            return Err(DomainError::invariant("campaign_id mismatch"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("campaign name must not be empty"));
        }
        if cmd.subject.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(DomainError::validation("subject override must not be blank"));
        }

        let mut created = cmd.clone();
        created.name = cmd.name.trim().to_string();
        Ok(vec![CampaignEvent::Created(created)])
    }
}
