//! Campaign orchestration: create, launch, cancel and completion.
//!
//! Lifecycle changes go through the `Campaign` aggregate and are saved with
//! an exact expected version, so a launch racing a cancel cannot overwrite it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use outreach_campaigns::{
    Campaign, CampaignCommand, CampaignCounters, CampaignEvent, CampaignSnapshot, CampaignStatus,
    CancelCampaign, CompleteCampaign, CreateCampaign, LeadFilter, Recipient, ScheduleCampaign,
    StartCampaign, TrackingEventType,
};
use outreach_core::{
    Aggregate, AggregateRoot, CampaignId, DomainError, ExpectedVersion, StateMachine, TemplateId,
};
use outreach_events::Event;

use crate::queue::{QueueError, QueueStats, QueueStore};
use crate::repository::{CampaignStore, LeadSource, RecipientStore, RepositoryError, TemplateStore};

/// Attempts made by `cancel` when its save loses a version race.
const CANCEL_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateId),
    #[error("template is inactive: {0}")]
    TemplateInactive(TemplateId),
    #[error("campaign {0} has no template")]
    MissingTemplate(CampaignId),
    #[error("no leads match the target filter of campaign {0}")]
    NoLeads(CampaignId),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<RepositoryError> for OrchestratorError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict { .. } => OrchestratorError::Conflict(err.to_string()),
            other => OrchestratorError::Repository(other),
        }
    }
}

/// Input for `create_campaign`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub template_id: TemplateId,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub target_filter: LeadFilter,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchReport {
    pub campaign: CampaignSnapshot,
    pub recipients: u64,
    pub enqueued: u64,
    /// Recipients that already had a job (relaunch after a crash).
    pub duplicates: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelReport {
    pub campaign: CampaignSnapshot,
    pub cancelled_jobs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignOverview {
    pub campaign: CampaignSnapshot,
    pub counters: CampaignCounters,
    pub queue: QueueStats,
    pub recipients: Vec<Recipient>,
}

/// One row of the campaign list. Rates are percentages of
/// `total_recipients`, rounded to one decimal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    pub campaign: CampaignSnapshot,
    pub counters: CampaignCounters,
    pub open_rate: f64,
    pub click_rate: f64,
}

impl CampaignSummary {
    fn new(campaign: CampaignSnapshot, counters: CampaignCounters) -> Self {
        let total = campaign.total_recipients;
        Self {
            open_rate: counters.rate(TrackingEventType::Opened, total),
            click_rate: counters.rate(TrackingEventType::Clicked, total),
            campaign,
            counters,
        }
    }
}

pub struct CampaignOrchestrator {
    campaigns: Arc<dyn CampaignStore>,
    templates: Arc<dyn TemplateStore>,
    leads: Arc<dyn LeadSource>,
    recipients: Arc<dyn RecipientStore>,
    queue: Arc<dyn QueueStore>,
    wake: Arc<Notify>,
    default_priority: i32,
}

impl CampaignOrchestrator {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        templates: Arc<dyn TemplateStore>,
        leads: Arc<dyn LeadSource>,
        recipients: Arc<dyn RecipientStore>,
        queue: Arc<dyn QueueStore>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            campaigns,
            templates,
            leads,
            recipients,
            queue,
            wake,
            default_priority: 0,
        }
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub async fn create_campaign(
        &self,
        input: NewCampaign,
        now: DateTime<Utc>,
    ) -> Result<CampaignSnapshot, OrchestratorError> {
        self.require_active_template(input.template_id).await?;

        let id = CampaignId::new();
        let mut campaign = Campaign::empty(id);
        campaign.execute(&CampaignCommand::Create(CreateCampaign {
            campaign_id: id,
            name: input.name,
            template_id: input.template_id,
            subject: input.subject,
            target_filter: input.target_filter,
            scheduled_at: input.scheduled_at,
            occurred_at: now,
        }))?;

        let snapshot = snapshot_of(&campaign)?;
        self.campaigns.insert_campaign(&snapshot).await?;
        info!(campaign_id = %id, name = %snapshot.name, "campaign created");
        Ok(snapshot)
    }

    pub async fn overview(&self, id: CampaignId) -> Result<CampaignOverview, OrchestratorError> {
        let campaign = self
            .campaigns
            .get_campaign(id)
            .await?
            .ok_or(OrchestratorError::CampaignNotFound(id))?;
        let counters = self.campaigns.campaign_counters(id).await?;
        let queue = self.queue.campaign_stats(id).await?;
        let recipients = self.recipients.list_recipients(id).await?;
        Ok(CampaignOverview {
            campaign,
            counters,
            queue,
            recipients,
        })
    }

    /// Every campaign, newest first.
    pub async fn list(&self) -> Result<Vec<CampaignSummary>, OrchestratorError> {
        let campaigns = self.campaigns.list_campaigns().await?;
        Ok(campaigns
            .into_iter()
            .map(|(campaign, counters)| CampaignSummary::new(campaign, counters))
            .collect())
    }

    /// Resolve recipients, enqueue one job each and start the campaign.
    ///
    /// A campaign left in `scheduled` by an interrupted launch can be
    /// launched again: existing recipients are reused and their jobs are
    /// reported as duplicates.
    pub async fn launch(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<LaunchReport, OrchestratorError> {
        let mut campaign = self.load(id).await?;
        match campaign.status() {
            CampaignStatus::Draft | CampaignStatus::Scheduled => {}
            other => {
                let err = DomainError::transition(CampaignStatus::ENTITY, other, CampaignStatus::Running);
                return Err(err.into());
            }
        }

        let template_id = campaign
            .template_id()
            .ok_or(OrchestratorError::MissingTemplate(id))?;
        self.require_active_template(template_id).await?;

        let leads = self.leads.find_leads(campaign.target_filter()).await?;
        let snapshots: Vec<Recipient> = leads
            .iter()
            .filter_map(|lead| Recipient::snapshot(id, lead, now))
            .collect();
        if snapshots.is_empty() {
            return Err(OrchestratorError::NoLeads(id));
        }

        if campaign.status() == CampaignStatus::Draft {
            self.apply(
                &mut campaign,
                CampaignCommand::Schedule(ScheduleCampaign { occurred_at: now }),
            )
            .await?;
        } else {
            info!(campaign_id = %id, "relaunching scheduled campaign");
        }

        let recipients = self.recipients.insert_recipients(snapshots).await?;
        let scheduled_for = campaign.scheduled_at().map_or(now, |at| at.max(now));

        let mut enqueued = 0;
        let mut duplicates = 0;
        for recipient in &recipients {
            match self
                .queue
                .enqueue(id, recipient.id, self.default_priority, scheduled_for)
                .await
            {
                Ok(_) => enqueued += 1,
                Err(QueueError::DuplicateJob { job_id }) => {
                    debug!(%job_id, recipient_id = %recipient.id, "job already enqueued");
                    duplicates += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let total_recipients = recipients.len() as u64;
        let start = CampaignCommand::Start(StartCampaign {
            total_recipients,
            occurred_at: now,
        });
        if let Err(err) = self.apply(&mut campaign, start).await {
            if matches!(err, OrchestratorError::Conflict(_)) {
                self.settle_after_conflict(id, now).await?;
            }
            return Err(err);
        }

        self.wake.notify_waiters();
        info!(
            campaign_id = %id,
            recipients = total_recipients,
            enqueued,
            duplicates,
            "campaign launched"
        );

        Ok(LaunchReport {
            campaign: snapshot_of(&campaign)?,
            recipients: total_recipients,
            enqueued,
            duplicates,
        })
    }

    /// Cancel the campaign and kill its not-yet-leased jobs. In-flight jobs
    /// finish and report normally. Cancelling twice is harmless.
    pub async fn cancel(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<CancelReport, OrchestratorError> {
        let mut attempt = 0;
        let campaign = loop {
            attempt += 1;
            let mut campaign = self.load(id).await?;
            let command = CampaignCommand::Cancel(CancelCampaign { occurred_at: now });
            match self.apply(&mut campaign, command).await {
                Ok(_) => break campaign,
                Err(OrchestratorError::Conflict(msg)) if attempt < CANCEL_ATTEMPTS => {
                    debug!(campaign_id = %id, attempt, conflict = %msg, "cancel lost a version race; retrying");
                }
                Err(err) => return Err(err),
            }
        };

        let cancelled_jobs = self.queue.cancel_pending(id, now).await?;
        info!(campaign_id = %id, cancelled_jobs, "campaign cancelled");
        Ok(CancelReport {
            campaign: snapshot_of(&campaign)?,
            cancelled_jobs,
        })
    }

    /// Complete a running campaign whose jobs are all `sent` or `dead`.
    /// Returns the completed snapshot, or `None` if nothing changed.
    pub async fn check_completion(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<CampaignSnapshot>, OrchestratorError> {
        let mut campaign = self.load(id).await?;
        if campaign.status() != CampaignStatus::Running {
            return Ok(None);
        }

        let stats = self.queue.campaign_stats(id).await?;
        if !stats.is_settled() {
            return Ok(None);
        }

        let command = CampaignCommand::Complete(CompleteCampaign { occurred_at: now });
        match self.apply(&mut campaign, command).await {
            Ok(_) => {
                info!(campaign_id = %id, sent = stats.sent, dead = stats.dead, "campaign completed");
                Ok(Some(snapshot_of(&campaign)?))
            }
            Err(OrchestratorError::Conflict(msg)) => {
                debug!(campaign_id = %id, conflict = %msg, "campaign changed during completion check");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Run `check_completion` for every running campaign. Failures are
    /// logged per campaign.
    pub async fn check_all(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, OrchestratorError> {
        let running = self
            .campaigns
            .list_campaigns_by_status(CampaignStatus::Running)
            .await?;

        let mut completed = Vec::new();
        for campaign in running {
            match self.check_completion(campaign.id, now).await {
                Ok(Some(c)) => completed.push(c.id),
                Ok(None) => {}
                Err(err) => {
                    warn!(campaign_id = %campaign.id, error = %err, "completion check failed");
                }
            }
        }
        Ok(completed)
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign, OrchestratorError> {
        self.campaigns
            .get_campaign(id)
            .await?
            .map(Campaign::from_snapshot)
            .ok_or(OrchestratorError::CampaignNotFound(id))
    }

    async fn require_active_template(&self, id: TemplateId) -> Result<(), OrchestratorError> {
        let template = self
            .templates
            .get_template(id)
            .await?
            .ok_or(OrchestratorError::TemplateNotFound(id))?;
        if !template.is_active {
            return Err(OrchestratorError::TemplateInactive(id));
        }
        Ok(())
    }

    /// Execute a command and save the result against the pre-command version.
    async fn apply(
        &self,
        campaign: &mut Campaign,
        command: CampaignCommand,
    ) -> Result<Vec<CampaignEvent>, OrchestratorError> {
        let expected = ExpectedVersion::Exact(campaign.version());
        let events = campaign.execute(&command)?;
        if events.is_empty() {
            return Ok(events);
        }

        self.campaigns
            .save_campaign(&snapshot_of(campaign)?, expected)
            .await?;
        for event in &events {
            debug!(campaign_id = %campaign.id(), event_type = event.event_type(), "campaign event applied");
        }
        Ok(events)
    }

    /// After a launch lost a race: if the winner cancelled the campaign,
    /// kill whatever this launch enqueued.
    async fn settle_after_conflict(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let current = self.load(id).await?;
        if current.is_cancelled() {
            let killed = self.queue.cancel_pending(id, now).await?;
            warn!(campaign_id = %id, killed, "launch raced a cancel; pending jobs cancelled");
        }
        Ok(())
    }
}

fn snapshot_of(campaign: &Campaign) -> Result<CampaignSnapshot, OrchestratorError> {
    campaign
        .snapshot()
        .ok_or_else(|| DomainError::invariant("campaign has not been created").into())
}

#[cfg(test)]
mod tests {
    use outreach_campaigns::{Lead, LeadEmail, Template};
    use outreach_core::LeadId;

    use super::*;
    use crate::queue::{InMemoryQueueStore, JobStatus};
    use crate::repository::InMemoryRepository;

    struct Fixture {
        orchestrator: CampaignOrchestrator,
        repo: Arc<InMemoryRepository>,
        queue: Arc<InMemoryQueueStore>,
        template_id: TemplateId,
    }

    fn lead(industry: &str) -> Lead {
        Lead {
            id: LeadId::new(),
            company_name: Some("Acme".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            industry: Some(industry.into()),
            city: None,
            state: None,
            country: None,
            company_size: None,
            status: None,
            source: None,
            tags: vec![],
            quality_score: None,
            emails: vec![LeadEmail {
                address: format!("{}@acme.test", LeadId::new()),
                is_primary: true,
                is_validated: true,
            }],
        }
    }

    async fn fixture(leads: usize) -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let queue = Arc::new(InMemoryQueueStore::default());
        for _ in 0..leads {
            repo.add_lead(lead("software")).unwrap();
        }
        let template = Template::new("intro", "Hi {{first_name}}", "<p>Hello from us</p>", vec![], Utc::now()).unwrap();
        repo.insert_template(&template).await.unwrap();

        let orchestrator = CampaignOrchestrator::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            queue.clone(),
            Arc::new(Notify::new()),
        );
        Fixture {
            orchestrator,
            repo,
            queue,
            template_id: template.id,
        }
    }

    fn new_campaign(f: &Fixture, industry: Option<&str>) -> NewCampaign {
        NewCampaign {
            name: "spring launch".into(),
            template_id: f.template_id,
            subject: None,
            target_filter: LeadFilter {
                industry: industry.map(str::to_string),
                ..LeadFilter::default()
            },
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn launch_enqueues_every_matching_lead() {
        let f = fixture(3).await;
        let now = Utc::now();
        let c = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Draft);

        let report = f.orchestrator.launch(c.id, now).await.unwrap();
        assert_eq!(report.campaign.status, CampaignStatus::Running);
        assert_eq!(report.recipients, 3);
        assert_eq!(report.enqueued, 3);
        assert_eq!(report.duplicates, 0);
        assert_eq!(report.campaign.total_recipients, 3);
        assert_eq!(f.queue.campaign_stats(c.id).await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn launch_without_leads_leaves_the_draft() {
        let f = fixture(2).await;
        let now = Utc::now();
        let c = f
            .orchestrator
            .create_campaign(new_campaign(&f, Some("retail")), now)
            .await
            .unwrap();

        let err = f.orchestrator.launch(c.id, now).await.unwrap_err();
        assert_eq!(err, OrchestratorError::NoLeads(c.id));
        let stored = f.repo.get_campaign(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn unknown_template_is_rejected() {
        let f = fixture(1).await;
        let mut input = new_campaign(&f, None);
        input.template_id = TemplateId::new();

        let err = f.orchestrator.create_campaign(input.clone(), Utc::now()).await.unwrap_err();
        assert_eq!(err, OrchestratorError::TemplateNotFound(input.template_id));
    }

    #[tokio::test]
    async fn inactive_template_is_rejected() {
        let f = fixture(1).await;
        let mut template = f.repo.get_template(f.template_id).await.unwrap().unwrap();
        template.is_active = false;
        f.repo.update_template(&template).await.unwrap();

        let err = f
            .orchestrator
            .create_campaign(new_campaign(&f, None), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::TemplateInactive(f.template_id));
    }

    #[tokio::test]
    async fn list_reports_rates_against_total_recipients() {
        let f = fixture(3).await;
        let now = Utc::now();
        let draft = f
            .orchestrator
            .create_campaign(new_campaign(&f, None), now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        let running = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();
        f.orchestrator.launch(running.id, now).await.unwrap();

        let overview = f.orchestrator.overview(running.id).await.unwrap();
        assert_eq!(overview.recipients.len(), 3);
        let opened = overview.recipients[0].id;
        f.repo
            .mark_recipient(opened, TrackingEventType::Opened, now, None)
            .await
            .unwrap();

        let listed = f.orchestrator.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].campaign.id, running.id);
        assert_eq!(listed[0].counters.opened, 1);
        assert_eq!(listed[0].open_rate, 33.3);
        assert_eq!(listed[0].click_rate, 0.0);
        assert_eq!(listed[1].campaign.id, draft.id);
        assert_eq!(listed[1].open_rate, 0.0);
    }

    #[tokio::test]
    async fn relaunch_of_a_scheduled_campaign_reports_duplicates() {
        let f = fixture(2).await;
        let now = Utc::now();
        let c = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();

        // Simulate a launch that crashed after enqueueing.
        let mut campaign = Campaign::from_snapshot(c.clone());
        f.orchestrator
            .apply(&mut campaign, CampaignCommand::Schedule(ScheduleCampaign { occurred_at: now }))
            .await
            .unwrap();
        let leads = f.repo.find_leads(&LeadFilter::default()).await.unwrap();
        let recipients = f
            .repo
            .insert_recipients(leads.iter().filter_map(|l| Recipient::snapshot(c.id, l, now)).collect())
            .await
            .unwrap();
        f.queue.enqueue(c.id, recipients[0].id, 0, now).await.unwrap();

        let report = f.orchestrator.launch(c.id, now).await.unwrap();
        assert_eq!(report.recipients, 2);
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(f.repo.list_recipients(c.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn jobs_wait_for_the_scheduled_time() {
        let f = fixture(1).await;
        let now = Utc::now();
        let later = now + chrono::Duration::hours(2);
        let mut input = new_campaign(&f, None);
        input.scheduled_at = Some(later);
        let c = f.orchestrator.create_campaign(input, now).await.unwrap();

        f.orchestrator.launch(c.id, now).await.unwrap();
        let jobs = f.queue.list_by_campaign(c.id).await.unwrap();
        assert_eq!(jobs[0].scheduled_for, later);
        assert!(f.queue.lease_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_kills_pending_jobs_without_bouncing() {
        let f = fixture(3).await;
        let now = Utc::now();
        let c = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();
        f.orchestrator.launch(c.id, now).await.unwrap();

        let report = f.orchestrator.cancel(c.id, now).await.unwrap();
        assert_eq!(report.campaign.status, CampaignStatus::Cancelled);
        assert_eq!(report.cancelled_jobs, 3);
        assert!(f
            .queue
            .list_by_campaign(c.id)
            .await
            .unwrap()
            .iter()
            .all(|j| j.status == JobStatus::Dead));
        assert!(f
            .repo
            .list_recipients(c.id)
            .await
            .unwrap()
            .iter()
            .all(|r| !r.is_bounced()));

        // Cancelling again is a no-op.
        let again = f.orchestrator.cancel(c.id, now).await.unwrap();
        assert_eq!(again.cancelled_jobs, 0);
    }

    #[tokio::test]
    async fn terminal_campaigns_cannot_be_relaunched() {
        let f = fixture(1).await;
        let now = Utc::now();
        let c = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();
        f.orchestrator.launch(c.id, now).await.unwrap();
        f.orchestrator.cancel(c.id, now).await.unwrap();

        let err = f.orchestrator.launch(c.id, now).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Domain(DomainError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn completion_waits_for_every_job() {
        let f = fixture(1).await;
        let now = Utc::now();
        let c = f.orchestrator.create_campaign(new_campaign(&f, None), now).await.unwrap();
        f.orchestrator.launch(c.id, now).await.unwrap();

        assert_eq!(f.orchestrator.check_completion(c.id, now).await.unwrap(), None);

        let job = f.queue.lease_next(now).await.unwrap().unwrap();
        f.queue
            .complete_job(
                job.id,
                job.lease_id.unwrap(),
                crate::queue::JobOutcome::PermanentFailure { error: "550".into() },
                now,
            )
            .await
            .unwrap();

        assert_eq!(f.orchestrator.check_all(now).await.unwrap(), vec![c.id]);
        let stored = f.repo.get_campaign(c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert!(stored.completed_at.is_some());
    }
}
