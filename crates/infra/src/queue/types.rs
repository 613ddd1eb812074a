//! Queue job types, outcomes and the retry policy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_core::{CampaignId, CredentialId, DomainError, DomainResult, JobId, RecipientId, StateMachine};

/// Send-job status.
///
/// `failed` is accepted from storage (and is lease-eligible) but the engine
/// itself never writes it: a failed attempt goes straight back to `pending`
/// with a later `scheduled_for`, or to `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Sent,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "in_flight",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    /// Whether a job in this status may be picked up by `lease_next`.
    pub fn is_leasable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_flight" => Ok(JobStatus::InFlight),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

impl StateMachine for JobStatus {
    const ENTITY: &'static str = "queue job";

    fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Dead)
                | (Failed, InFlight)
                | (Failed, Pending)
                | (Failed, Dead)
                | (InFlight, Sent)
                | (InFlight, Pending)
                | (InFlight, Dead)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Dead)
    }
}

/// Why a job ended up `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    RetriesExhausted,
    PermanentFailure,
    Cancelled,
    RecipientBounced,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::RetriesExhausted => "retries_exhausted",
            DeadReason::PermanentFailure => "permanent_failure",
            DeadReason::Cancelled => "cancelled",
            DeadReason::RecipientBounced => "recipient_bounced",
        }
    }

    /// Whether the recipient should be marked bounced when a job dies this way.
    pub fn bounces_recipient(self) -> bool {
        matches!(self, DeadReason::RetriesExhausted | DeadReason::PermanentFailure)
    }
}

impl FromStr for DeadReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retries_exhausted" => Ok(DeadReason::RetriesExhausted),
            "permanent_failure" => Ok(DeadReason::PermanentFailure),
            "cancelled" => Ok(DeadReason::Cancelled),
            "recipient_bounced" => Ok(DeadReason::RecipientBounced),
            other => Err(DomainError::validation(format!("unknown dead reason: {other}"))),
        }
    }
}

/// Identity of one lease. A job re-leased after a reap gets a new one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The transport accepted the message.
    Sent { credential_id: CredentialId },
    /// Retry later with backoff, or die once retries are exhausted.
    TransientFailure { error: String },
    /// Dead immediately; the recipient bounces.
    PermanentFailure { error: String },
    /// No credential had quota. Back to `pending` without penalty.
    Deferred,
    /// Cannot be attempted before `until` for a reason that is not the
    /// recipient's (template unavailable). Back to `pending` without penalty.
    Postponed { until: DateTime<Utc>, reason: String },
    /// Dead without bouncing the recipient.
    Abandoned { reason: DeadReason },
}

/// Effect of completing a job, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Sent,
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Deferred,
    Dead { reason: DeadReason },
}

/// Retry policy applied to transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0-1.0) of the delay randomly added or removed.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before the attempt following failure number `retry_count`:
    /// `base * 2^retry_count`, capped at `max_delay`, then jittered.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(retry_count.min(30) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// One send-job: a (campaign, recipient) pair moving through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_for: DateTime<Utc>,
    pub lease_id: Option<LeaseId>,
    pub leased_at: Option<DateTime<Utc>>,
    pub credential_id: Option<CredentialId>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dead_reason: Option<DeadReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        priority: i32,
        max_retries: u32,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            campaign_id,
            recipient_id,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            scheduled_for,
            lease_id: None,
            leased_at: None,
            credential_id: None,
            sent_at: None,
            last_error: None,
            dead_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leasable() && self.scheduled_for <= now
    }

    /// Ordering key for `lease_next`: priority desc, then `scheduled_for`, then id.
    pub fn lease_order(&self) -> (core::cmp::Reverse<i32>, DateTime<Utc>, JobId) {
        (core::cmp::Reverse(self.priority), self.scheduled_for, self.id)
    }

    pub fn holds_lease(&self, lease_id: LeaseId) -> bool {
        self.status == JobStatus::InFlight && self.lease_id == Some(lease_id)
    }

    /// Move to `in_flight` under a fresh lease.
    pub fn lease(&mut self, now: DateTime<Utc>) -> DomainResult<LeaseId> {
        self.status = self.status.transition(JobStatus::InFlight)?;
        let lease_id = LeaseId::new();
        self.lease_id = Some(lease_id);
        self.leased_at = Some(now);
        self.updated_at = now;
        Ok(lease_id)
    }

    /// Apply the outcome of the current attempt. The caller checks the lease.
    pub fn apply_outcome(
        &mut self,
        outcome: JobOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<Completion> {
        let completion = match outcome {
            JobOutcome::Sent { credential_id } => {
                self.status = self.status.transition(JobStatus::Sent)?;
                self.credential_id = Some(credential_id);
                self.sent_at = Some(now);
                Completion::Sent
            }
            JobOutcome::TransientFailure { error } => {
                let retry_count = self.retry_count + 1;
                self.last_error = Some(error);
                if retry_count <= self.max_retries {
                    self.status = self.status.transition(JobStatus::Pending)?;
                    let delay = chrono::Duration::from_std(policy.delay_for_retry(retry_count))
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                    self.scheduled_for = now + delay;
                    self.retry_count = retry_count;
                    Completion::Retrying {
                        retry_count,
                        next_attempt_at: self.scheduled_for,
                    }
                } else {
                    self.status = self.status.transition(JobStatus::Dead)?;
                    self.retry_count = retry_count;
                    self.dead_reason = Some(DeadReason::RetriesExhausted);
                    Completion::Dead {
                        reason: DeadReason::RetriesExhausted,
                    }
                }
            }
            JobOutcome::PermanentFailure { error } => {
                self.status = self.status.transition(JobStatus::Dead)?;
                self.last_error = Some(error);
                self.dead_reason = Some(DeadReason::PermanentFailure);
                Completion::Dead {
                    reason: DeadReason::PermanentFailure,
                }
            }
            JobOutcome::Deferred => {
                self.status = self.status.transition(JobStatus::Pending)?;
                Completion::Deferred
            }
            JobOutcome::Postponed { until, reason } => {
                self.status = self.status.transition(JobStatus::Pending)?;
                self.scheduled_for = until.max(now);
                self.last_error = Some(reason);
                Completion::Deferred
            }
            JobOutcome::Abandoned { reason } => {
                self.status = self.status.transition(JobStatus::Dead)?;
                self.dead_reason = Some(reason);
                Completion::Dead { reason }
            }
        };

        self.lease_id = None;
        self.leased_at = None;
        self.updated_at = now;
        Ok(completion)
    }

    /// Whether the lease is older than `timeout`.
    pub fn lease_expired(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::InFlight && self.leased_at.is_some_and(|at| at + timeout < now)
    }

    /// Return an abandoned lease to `pending`. `retry_count` is untouched.
    pub fn release_stale(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.status = self.status.transition(JobStatus::Pending)?;
        self.lease_id = None;
        self.leased_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Kill a not-yet-leased job because its campaign was cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_leasable() {
            return Err(DomainError::transition(
                JobStatus::ENTITY,
                self.status,
                JobStatus::Dead,
            ));
        }
        self.status = self.status.transition(JobStatus::Dead)?;
        self.dead_reason = Some(DeadReason::Cancelled);
        self.updated_at = now;
        Ok(())
    }
}
