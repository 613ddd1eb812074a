//! Dispatcher: leases queue jobs, reserves credential quota, renders and
//! sends, then records the outcome.
//!
//! One cycle handles at most one job. No lock or database transaction is
//! held across the transport call; the job lease and the credential
//! reservation are the only coordination between workers.

pub mod render;
pub mod transport;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use outreach_campaigns::{CampaignStatus, RenderedMessage, TrackingEvent, TrackingEventType};
use outreach_core::JobId;

use crate::credentials::{Acquisition, CredentialPool, PoolError, Reservation};
use crate::queue::{Completion, DeadReason, JobOutcome, LeaseId, QueueError, QueueJob, QueueStore};
use crate::repository::{CampaignStore, RecipientStore, RepositoryError};
use crate::tracking::{TrackingError, TrackingRecorder};

pub use render::{MessageRenderer, RenderError, TemplateRenderer};
pub use transport::{LogTransport, MailTransport, SendError};
pub use worker::{DispatcherConfig, DispatcherHandle};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was due.
    Idle,
    Sent,
    Retrying { next_attempt_at: DateTime<Utc> },
    Dead { reason: DeadReason },
    /// No credential had quota; the job went back to pending.
    Deferred,
    Abandoned { reason: DeadReason },
    /// The lease expired and was reclaimed before completion.
    LeaseLost,
}

/// Running totals since start.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    processed: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    deferred: AtomicU64,
    abandoned: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub processed: u64,
    pub sent: u64,
    pub retried: u64,
    pub dead: u64,
    pub deferred: u64,
    pub abandoned: u64,
    pub errors: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, outcome: &CycleOutcome) {
        let counter = match outcome {
            CycleOutcome::Idle => return,
            CycleOutcome::Sent => &self.sent,
            CycleOutcome::Retrying { .. } => &self.retried,
            CycleOutcome::Dead { .. } => &self.dead,
            CycleOutcome::Deferred => &self.deferred,
            CycleOutcome::Abandoned { .. } => &self.abandoned,
            CycleOutcome::LeaseLost => &self.errors,
        };
        self.processed.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    credentials: Arc<dyn CredentialPool>,
    recipients: Arc<dyn RecipientStore>,
    campaigns: Arc<dyn CampaignStore>,
    renderer: Arc<dyn MessageRenderer>,
    transport: Arc<dyn MailTransport>,
    recorder: Arc<TrackingRecorder>,
    stats: Arc<DispatcherStats>,
    wake: Arc<Notify>,
    send_timeout: Option<Duration>,
    render_backoff: chrono::Duration,
}

/// How long a job waits when its template cannot be rendered.
pub const DEFAULT_RENDER_BACKOFF_SECS: i64 = 300;

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        credentials: Arc<dyn CredentialPool>,
        recipients: Arc<dyn RecipientStore>,
        campaigns: Arc<dyn CampaignStore>,
        renderer: Arc<dyn MessageRenderer>,
        transport: Arc<dyn MailTransport>,
        recorder: Arc<TrackingRecorder>,
    ) -> Self {
        Self {
            queue,
            credentials,
            recipients,
            campaigns,
            renderer,
            transport,
            recorder,
            stats: Arc::new(DispatcherStats::default()),
            wake: Arc::new(Notify::new()),
            send_timeout: None,
            render_backoff: chrono::Duration::seconds(DEFAULT_RENDER_BACKOFF_SECS),
        }
    }

    /// Bound every transport call. Keep this below the reaper's lease
    /// timeout so a stuck send is abandoned before its job can be re-leased.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_render_backoff(mut self, backoff: chrono::Duration) -> Self {
        self.render_backoff = backoff;
        self
    }

    /// Share a wake signal with whoever enqueues work.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Lease and process at most one job.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleOutcome, DispatchError> {
        let Some(job) = self.queue.lease_next(now).await? else {
            return Ok(CycleOutcome::Idle);
        };
        let lease_id = job.lease_id.ok_or(QueueError::LeaseLost(job.id))?;
        debug!(job_id = %job.id, recipient_id = %job.recipient_id, "job leased");

        let outcome = self.process(&job, lease_id, now).await?;
        self.stats.observe(&outcome);
        Ok(outcome)
    }

    async fn process(
        &self,
        job: &QueueJob,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        let Some(recipient) = self.recipients.get_recipient(job.recipient_id).await? else {
            warn!(job_id = %job.id, recipient_id = %job.recipient_id, "recipient missing; job dropped");
            let error = format!("recipient {} not found", job.recipient_id);
            return self
                .complete(job.id, lease_id, JobOutcome::PermanentFailure { error }, now)
                .await;
        };
        if recipient.is_bounced() {
            return self
                .abandon(job.id, lease_id, DeadReason::RecipientBounced, now)
                .await;
        }

        let campaign = match self.campaigns.get_campaign(job.campaign_id).await? {
            Some(c) if c.status != CampaignStatus::Cancelled => c,
            _ => return self.abandon(job.id, lease_id, DeadReason::Cancelled, now).await,
        };

        let reservation = match self.credentials.acquire().await? {
            Acquisition::Reserved(r) => r,
            Acquisition::Unavailable => {
                debug!(job_id = %job.id, "no credential quota left; deferring");
                return self.complete(job.id, lease_id, JobOutcome::Deferred, now).await;
            }
        };

        let message = match self.renderer.render(&campaign, &recipient).await {
            Ok(m) => m,
            Err(err) => {
                // Not the recipient's fault: wait for the template without
                // spending a retry.
                let until = now + self.render_backoff;
                warn!(job_id = %job.id, error = %err, %until, "render failed; job postponed");
                self.credentials.release(&reservation, false).await?;
                let outcome = JobOutcome::Postponed { until, reason: err.to_string() };
                return self.complete(job.id, lease_id, outcome, now).await;
            }
        };

        match self.send(&reservation, &recipient.email, &message).await {
            Ok(()) => self.delivered(job, lease_id, &reservation, now).await,
            Err(SendError::Transient(error)) => {
                self.credentials.release(&reservation, false).await?;
                self.transient(job, lease_id, error, now).await
            }
            Err(SendError::Permanent(error)) => {
                self.credentials.release(&reservation, false).await?;
                warn!(job_id = %job.id, error = %error, "permanent send failure");
                let outcome = self
                    .complete(
                        job.id,
                        lease_id,
                        JobOutcome::PermanentFailure { error: error.clone() },
                        now,
                    )
                    .await?;
                if matches!(outcome, CycleOutcome::Dead { .. }) {
                    self.record_bounce(job, error, now).await;
                }
                Ok(outcome)
            }
        }
    }

    async fn send(
        &self,
        reservation: &Reservation,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<(), SendError> {
        let send = self.transport.send(&reservation.credential, to, message);
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
                Err(SendError::Transient(format!(
                    "send timed out after {}ms",
                    limit.as_millis()
                )))
            }),
            None => send.await,
        }
    }

    async fn delivered(
        &self,
        job: &QueueJob,
        lease_id: LeaseId,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        let credential_id = reservation.credential_id();
        self.credentials.release(reservation, true).await?;

        match self
            .queue
            .complete_job(job.id, lease_id, JobOutcome::Sent { credential_id }, now)
            .await
        {
            Ok(_) => {}
            // The message went out; the reaper reclaimed the row meanwhile.
            Err(QueueError::LeaseLost(_)) => {
                warn!(job_id = %job.id, "lease lost after delivery; the job may be sent again");
            }
            Err(err) => return Err(err.into()),
        }

        let event = TrackingEvent::new(job.campaign_id, job.recipient_id, TrackingEventType::Sent, now)
            .with_metadata(json!({ "job_id": job.id, "credential_id": credential_id }));
        self.record(event).await;
        info!(job_id = %job.id, credential_id = %credential_id, "message sent");
        Ok(CycleOutcome::Sent)
    }

    async fn transient(
        &self,
        job: &QueueJob,
        lease_id: LeaseId,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        // A campaign cancelled while we were sending must not re-enqueue.
        let cancelled = self
            .campaigns
            .get_campaign(job.campaign_id)
            .await?
            .is_none_or(|c| c.status == CampaignStatus::Cancelled);
        if cancelled {
            return self.abandon(job.id, lease_id, DeadReason::Cancelled, now).await;
        }

        let outcome = self
            .complete(
                job.id,
                lease_id,
                JobOutcome::TransientFailure { error: error.clone() },
                now,
            )
            .await?;
        match &outcome {
            CycleOutcome::Retrying { next_attempt_at } => {
                debug!(job_id = %job.id, %next_attempt_at, error = %error, "transient failure; retry scheduled");
            }
            CycleOutcome::Dead { .. } => {
                warn!(job_id = %job.id, error = %error, "retries exhausted");
                self.record_bounce(job, format!("retries exhausted: {error}"), now)
                    .await;
            }
            _ => {}
        }
        Ok(outcome)
    }

    async fn abandon(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        reason: DeadReason,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        debug!(%job_id, reason = reason.as_str(), "job abandoned");
        self.complete(job_id, lease_id, JobOutcome::Abandoned { reason }, now)
            .await
    }

    async fn complete(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        match self.queue.complete_job(job_id, lease_id, outcome, now).await {
            Ok(Completion::Sent) => Ok(CycleOutcome::Sent),
            Ok(Completion::Retrying {
                next_attempt_at, ..
            }) => Ok(CycleOutcome::Retrying { next_attempt_at }),
            Ok(Completion::Deferred) => Ok(CycleOutcome::Deferred),
            Ok(Completion::Dead { reason }) if reason.bounces_recipient() => {
                Ok(CycleOutcome::Dead { reason })
            }
            Ok(Completion::Dead { reason }) => Ok(CycleOutcome::Abandoned { reason }),
            Err(QueueError::LeaseLost(_)) => {
                warn!(%job_id, "lease lost before completion");
                Ok(CycleOutcome::LeaseLost)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn record_bounce(&self, job: &QueueJob, reason: String, now: DateTime<Utc>) {
        let event =
            TrackingEvent::new(job.campaign_id, job.recipient_id, TrackingEventType::Bounced, now)
                .with_metadata(json!({ "job_id": job.id, "reason": reason }));
        self.record(event).await;
    }

    /// Tracking failures after a completed attempt are logged, not retried:
    /// the queue row already holds the outcome and `reconcile` surfaces drift.
    async fn record(&self, event: TrackingEvent) {
        let event_type = event.event_type;
        let recipient_id = event.recipient_id;
        if let Err(err) = self.recorder.record(event).await {
            self.stats.record_error();
            warn!(%recipient_id, %event_type, error = %err, "failed to record tracking event");
        }
    }
}
