//! In-memory repository for tests/dev.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outreach_campaigns::{
    CampaignCounters, CampaignSnapshot, CampaignStatus, FlagChange, Lead, LeadFilter, Recipient,
    Template, TrackingEventType, TrackingId,
};
use outreach_core::{CampaignId, ExpectedVersion, LeadId, RecipientId, TemplateId};

use super::{CampaignStore, LeadSource, RecipientStore, RepositoryError, TemplateStore};

#[derive(Debug, Default)]
struct CampaignRow {
    snapshot: Option<CampaignSnapshot>,
    counters: CampaignCounters,
}

#[derive(Debug, Default)]
struct State {
    campaigns: HashMap<CampaignId, CampaignRow>,
    templates: HashMap<TemplateId, Template>,
    leads: BTreeMap<LeadId, Lead>,
    recipients: HashMap<RecipientId, Recipient>,
    by_pair: HashMap<(CampaignId, LeadId), RecipientId>,
    by_tracking_id: HashMap<TrackingId, RecipientId>,
}

/// All repository traits over one lock, so flag + counter updates are atomic.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a lead (stands in for the import pipeline).
    pub fn add_lead(&self, lead: Lead) -> Result<(), RepositoryError> {
        self.state.write()?.leads.insert(lead.id, lead);
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for InMemoryRepository {
    async fn insert_campaign(&self, campaign: &CampaignSnapshot) -> Result<(), RepositoryError> {
        let mut state = self.state.write()?;
        let row = state.campaigns.entry(campaign.id).or_default();
        if row.snapshot.is_some() {
            return Err(RepositoryError::Duplicate("campaign"));
        }
        row.snapshot = Some(campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<CampaignSnapshot>, RepositoryError> {
        let state = self.state.read()?;
        Ok(state.campaigns.get(&id).and_then(|r| r.snapshot.clone()))
    }

    async fn save_campaign(
        &self,
        campaign: &CampaignSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write()?;
        let stored = state
            .campaigns
            .get_mut(&campaign.id)
            .and_then(|r| r.snapshot.as_mut())
            .ok_or(RepositoryError::not_found("campaign"))?;

        if !expected.matches(stored.version) {
            return Err(RepositoryError::Conflict {
                expected,
                actual: stored.version,
            });
        }
        *stored = campaign.clone();
        Ok(())
    }

    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignSnapshot>, RepositoryError> {
        let state = self.state.read()?;
        let mut campaigns: Vec<_> = state
            .campaigns
            .values()
            .filter_map(|r| r.snapshot.as_ref())
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.id);
        Ok(campaigns)
    }

    async fn campaign_counters(&self, id: CampaignId) -> Result<CampaignCounters, RepositoryError> {
        let state = self.state.read()?;
        state
            .campaigns
            .get(&id)
            .filter(|r| r.snapshot.is_some())
            .map(|r| r.counters)
            .ok_or(RepositoryError::not_found("campaign"))
    }

    async fn list_campaigns(&self) -> Result<Vec<(CampaignSnapshot, CampaignCounters)>, RepositoryError> {
        let state = self.state.read()?;
        let mut campaigns: Vec<_> = state
            .campaigns
            .values()
            .filter_map(|r| r.snapshot.clone().map(|s| (s, r.counters)))
            .collect();
        campaigns.sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(campaigns)
    }
}

#[async_trait]
impl TemplateStore for InMemoryRepository {
    async fn insert_template(&self, template: &Template) -> Result<(), RepositoryError> {
        let mut state = self.state.write()?;
        if state.templates.contains_key(&template.id) {
            return Err(RepositoryError::Duplicate("template"));
        }
        state.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError> {
        Ok(self.state.read()?.templates.get(&id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<Template>, RepositoryError> {
        let state = self.state.read()?;
        let mut templates: Vec<_> = state.templates.values().cloned().collect();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(templates)
    }

    async fn update_template(&self, template: &Template) -> Result<(), RepositoryError> {
        let mut state = self.state.write()?;
        let stored = state
            .templates
            .get_mut(&template.id)
            .ok_or(RepositoryError::not_found("template"))?;
        *stored = template.clone();
        Ok(())
    }

    async fn delete_template(&self, id: TemplateId) -> Result<(), RepositoryError> {
        let mut state = self.state.write()?;
        let referenced = state
            .campaigns
            .values()
            .filter_map(|r| r.snapshot.as_ref())
            .any(|c| c.template_id == Some(id));
        if referenced {
            return Err(RepositoryError::InUse("template"));
        }
        state
            .templates
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::not_found("template"))
    }
}

#[async_trait]
impl LeadSource for InMemoryRepository {
    async fn find_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        let state = self.state.read()?;
        Ok(state
            .leads
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecipientStore for InMemoryRepository {
    async fn insert_recipients(
        &self,
        recipients: Vec<Recipient>,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let mut state = self.state.write()?;

        // Validate the whole batch before touching state.
        let mut new_pairs = HashSet::new();
        let mut new_tracking_ids = HashSet::new();
        for recipient in &recipients {
            let pair = (recipient.campaign_id, recipient.lead_id);
            if state.by_pair.contains_key(&pair) || !new_pairs.insert(pair) {
                continue;
            }
            if state.by_tracking_id.contains_key(&recipient.tracking_id)
                || !new_tracking_ids.insert(&recipient.tracking_id)
            {
                return Err(RepositoryError::Duplicate("tracking id"));
            }
        }

        let mut stored = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let pair = (recipient.campaign_id, recipient.lead_id);
            if let Some(existing) = state.by_pair.get(&pair).and_then(|id| state.recipients.get(id)) {
                stored.push(existing.clone());
                continue;
            }
            state.by_pair.insert(pair, recipient.id);
            state
                .by_tracking_id
                .insert(recipient.tracking_id.clone(), recipient.id);
            state.recipients.insert(recipient.id, recipient.clone());
            stored.push(recipient);
        }
        Ok(stored)
    }

    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>, RepositoryError> {
        Ok(self.state.read()?.recipients.get(&id).cloned())
    }

    async fn find_by_tracking_id(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<Recipient>, RepositoryError> {
        let state = self.state.read()?;
        Ok(state
            .by_tracking_id
            .get(tracking_id)
            .and_then(|id| state.recipients.get(id))
            .cloned())
    }

    async fn list_recipients(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>, RepositoryError> {
        let state = self.state.read()?;
        let mut recipients: Vec<_> = state
            .recipients
            .values()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect();
        recipients.sort_by_key(|r| r.id);
        Ok(recipients)
    }

    async fn mark_recipient(
        &self,
        id: RecipientId,
        event_type: TrackingEventType,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<FlagChange, RepositoryError> {
        let mut guard = self.state.write()?;
        let state = &mut *guard;

        let recipient = state
            .recipients
            .get_mut(&id)
            .ok_or(RepositoryError::not_found("recipient"))?;
        let change = recipient.mark(event_type, at, reason);

        if change == FlagChange::Set {
            state
                .campaigns
                .entry(recipient.campaign_id)
                .or_default()
                .counters
                .increment(event_type);
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use outreach_campaigns::{Campaign, CreateCampaign, CampaignCommand, LeadEmail};
    use outreach_core::{Aggregate, AggregateRoot};

    use super::*;

    fn lead(industry: &str) -> Lead {
        Lead {
            id: LeadId::new(),
            company_name: Some("Acme".into()),
            first_name: None,
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
                address: format!("{}@example.test", LeadId::new()),
                is_primary: true,
                is_validated: true,
            }],
        }
    }

    fn campaign() -> CampaignSnapshot {
        let id = CampaignId::new();
        let mut c = Campaign::empty(id);
        c.execute(&CampaignCommand::Create(CreateCampaign {
            campaign_id: id,
            name: "test".into(),
            template_id: TemplateId::new(),
            subject: None,
            target_filter: LeadFilter::default(),
            scheduled_at: None,
            occurred_at: Utc::now(),
        }))
        .unwrap();
        assert_eq!(c.version(), 1);
        c.snapshot().unwrap()
    }

    #[tokio::test]
    async fn save_checks_expected_version() {
        let repo = InMemoryRepository::new();
        let mut snap = campaign();
        repo.insert_campaign(&snap).await.unwrap();

        snap.version = 2;
        snap.status = CampaignStatus::Scheduled;
        repo.save_campaign(&snap, ExpectedVersion::Exact(1)).await.unwrap();

        let err = repo
            .save_campaign(&snap, ExpectedVersion::Exact(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RepositoryError::Conflict {
                expected: ExpectedVersion::Exact(1),
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn recipients_are_unique_per_campaign_and_lead() {
        let repo = InMemoryRepository::new();
        let snap = campaign();
        repo.insert_campaign(&snap).await.unwrap();
        let l = lead("software");

        let first = Recipient::snapshot(snap.id, &l, Utc::now()).unwrap();
        let second = Recipient::snapshot(snap.id, &l, Utc::now()).unwrap();

        let stored = repo.insert_recipients(vec![first.clone()]).await.unwrap();
        let again = repo.insert_recipients(vec![second]).await.unwrap();

        assert_eq!(stored[0].id, first.id);
        assert_eq!(again[0].id, first.id);
        assert_eq!(repo.list_recipients(snap.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tracking_id_clash_rejects_the_whole_batch() {
        let repo = InMemoryRepository::new();
        let snap = campaign();
        repo.insert_campaign(&snap).await.unwrap();

        let first = Recipient::snapshot(snap.id, &lead("software"), Utc::now()).unwrap();
        let mut clash = Recipient::snapshot(snap.id, &lead("retail"), Utc::now()).unwrap();
        clash.tracking_id = first.tracking_id.clone();

        let err = repo.insert_recipients(vec![first.clone(), clash]).await.unwrap_err();
        assert_eq!(err, RepositoryError::Duplicate("tracking id"));
        assert!(repo.list_recipients(snap.id).await.unwrap().is_empty());
        assert!(repo.find_by_tracking_id(&first.tracking_id).await.unwrap().is_none());

        // The batch can be retried once the clash is gone.
        let stored = repo.insert_recipients(vec![first.clone()]).await.unwrap();
        assert_eq!(stored[0].id, first.id);
    }

    #[tokio::test]
    async fn referenced_templates_cannot_be_deleted() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let mut template = Template::new("intro", "Hello", "<p>Hello there</p>", vec![], now).unwrap();
        repo.insert_template(&template).await.unwrap();
        let unused = Template::new("spare", "Hi", "<p>Hello again</p>", vec![], now).unwrap();
        repo.insert_template(&unused).await.unwrap();

        let mut snap = campaign();
        snap.template_id = Some(template.id);
        repo.insert_campaign(&snap).await.unwrap();

        template.is_active = false;
        repo.update_template(&template).await.unwrap();
        assert!(!repo.get_template(template.id).await.unwrap().unwrap().is_active);
        assert_eq!(repo.list_templates().await.unwrap().len(), 2);

        assert_eq!(
            repo.delete_template(template.id).await.unwrap_err(),
            RepositoryError::InUse("template")
        );
        repo.delete_template(unused.id).await.unwrap();
        assert_eq!(
            repo.delete_template(unused.id).await.unwrap_err(),
            RepositoryError::not_found("template")
        );
        assert_eq!(repo.list_templates().await.unwrap(), vec![template]);
    }

    #[tokio::test]
    async fn campaigns_are_listed_newest_first_with_counters() {
        let repo = InMemoryRepository::new();
        let mut older = campaign();
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let newer = campaign();
        repo.insert_campaign(&older).await.unwrap();
        repo.insert_campaign(&newer).await.unwrap();

        let r = Recipient::snapshot(older.id, &lead("software"), Utc::now()).unwrap();
        repo.insert_recipients(vec![r.clone()]).await.unwrap();
        repo.mark_recipient(r.id, TrackingEventType::Sent, Utc::now(), None)
            .await
            .unwrap();

        let listed = repo.list_campaigns().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|(c, _)| c.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert_eq!(listed[1].1.sent, 1);
        assert_eq!(listed[0].1.sent, 0);
    }

    #[tokio::test]
    async fn marking_twice_counts_once() {
        let repo = InMemoryRepository::new();
        let snap = campaign();
        repo.insert_campaign(&snap).await.unwrap();
        let r = Recipient::snapshot(snap.id, &lead("software"), Utc::now()).unwrap();
        repo.insert_recipients(vec![r.clone()]).await.unwrap();

        let now = Utc::now();
        assert_eq!(
            repo.mark_recipient(r.id, TrackingEventType::Opened, now, None).await.unwrap(),
            FlagChange::Set
        );
        assert_eq!(
            repo.mark_recipient(r.id, TrackingEventType::Opened, now, None).await.unwrap(),
            FlagChange::AlreadySet
        );

        let counters = repo.campaign_counters(snap.id).await.unwrap();
        assert_eq!(counters.opened, 1);
        assert_eq!(
            repo.find_by_tracking_id(&r.tracking_id).await.unwrap().unwrap().id,
            r.id
        );
    }

    #[tokio::test]
    async fn leads_are_filtered() {
        let repo = InMemoryRepository::new();
        repo.add_lead(lead("software")).unwrap();
        repo.add_lead(lead("retail")).unwrap();

        let filter = LeadFilter {
            industry: Some("retail".into()),
            ..LeadFilter::default()
        };
        let found = repo.find_leads(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].industry.as_deref(), Some("retail"));
    }
}
