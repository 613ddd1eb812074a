//! Queue store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use outreach_core::{CampaignId, DomainError, JobId, RecipientId};

use super::types::{Completion, JobOutcome, JobStatus, LeaseId, QueueJob, RetryPolicy};

/// Durable set of send-jobs, one per (campaign, recipient) pair.
///
/// Every state change is a single linearizable step: leasing picks and claims
/// in one operation, and completion is guarded by the lease identity.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create the job for a pair. Fails with [`QueueError::DuplicateJob`] if
    /// the pair already has one, whatever its status.
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        priority: i32,
        scheduled_for: DateTime<Utc>,
    ) -> Result<JobId, QueueError>;

    /// Claim the best ready job, or `None` when nothing is due.
    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>, QueueError>;

    /// Record the outcome of a leased attempt.
    async fn complete_job(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion, QueueError>;

    /// Return `in_flight` jobs leased longer than `timeout` to `pending`.
    async fn reap_stale_leases(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError>;

    /// Kill every not-yet-leased job of a campaign. Returns how many died.
    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, QueueError>;

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<QueueJob>, QueueError>;

    async fn campaign_stats(&self, campaign_id: CampaignId) -> Result<QueueStats, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job already exists for this recipient: {job_id}")]
    DuplicateJob { job_id: JobId },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => QueueError::InvalidTransition(msg),
            other => QueueError::Storage(other.to_string()),
        }
    }
}

impl<T> From<PoisonError<T>> for QueueError {
    fn from(_: PoisonError<T>) -> Self {
        QueueError::Storage("queue lock poisoned".to_string())
    }
}

/// Job counts per status for one campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InFlight => self.in_flight += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.sent + self.failed + self.dead
    }

    /// Every job reached `sent` or `dead`.
    pub fn is_settled(&self) -> bool {
        self.total() > 0 && self.pending + self.in_flight + self.failed == 0
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, QueueJob>,
    by_pair: HashMap<(CampaignId, RecipientId), JobId>,
}

/// In-memory queue for tests/dev. One lock guards the whole queue.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: RwLock<QueueState>,
    policy: RetryPolicy,
}

impl InMemoryQueueStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Test hook: overwrite a stored job.
    pub fn put(&self, job: QueueJob) -> Result<(), QueueError> {
        let mut state = self.state.write()?;
        state.by_pair.insert((job.campaign_id, job.recipient_id), job.id);
        state.jobs.insert(job.id, job);
        Ok(())
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        priority: i32,
        scheduled_for: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let mut state = self.state.write()?;
        if let Some(existing) = state.by_pair.get(&(campaign_id, recipient_id)) {
            return Err(QueueError::DuplicateJob { job_id: *existing });
        }

        let job = QueueJob::new(
            campaign_id,
            recipient_id,
            priority,
            self.policy.max_retries,
            scheduled_for,
            Utc::now(),
        );
        let id = job.id;
        state.by_pair.insert((campaign_id, recipient_id), id);
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>, QueueError> {
        let mut state = self.state.write()?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| j.lease_order())
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.lease(now)?;
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion, QueueError> {
        let mut state = self.state.write()?;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if !job.holds_lease(lease_id) {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(job.apply_outcome(outcome, &self.policy, now)?)
    }

    async fn reap_stale_leases(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut state = self.state.write()?;
        let mut reaped = Vec::new();
        for job in state.jobs.values_mut() {
            if job.lease_expired(timeout, now) {
                job.release_stale(now)?;
                reaped.push(job.id);
            }
        }
        reaped.sort();
        Ok(reaped)
    }

    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let mut state = self.state.write()?;
        let mut cancelled = 0;
        for job in state
            .jobs
            .values_mut()
            .filter(|j| j.campaign_id == campaign_id && j.status.is_leasable())
        {
            job.cancel(now)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, QueueError> {
        Ok(self.state.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<QueueJob>, QueueError> {
        let state = self.state.read()?;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.campaign_id == campaign_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn campaign_stats(&self, campaign_id: CampaignId) -> Result<QueueStats, QueueError> {
        let state = self.state.read()?;
        let mut stats = QueueStats::default();
        for job in state.jobs.values().filter(|j| j.campaign_id == campaign_id) {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}
