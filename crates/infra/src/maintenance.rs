//! Background maintenance: stale-lease reaper, daily quota reset and the
//! campaign completion monitor. All stop on the shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use outreach_core::{CampaignId, JobId};

use crate::credentials::{CredentialPool, PoolError};
use crate::orchestrator::{CampaignOrchestrator, OrchestratorError};
use crate::queue::{QueueError, QueueStore};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// An `in_flight` job older than this is presumed lost.
    pub lease_timeout: Duration,
    pub reap_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(30),
        }
    }
}

pub struct Maintenance {
    queue: Arc<dyn QueueStore>,
    credentials: Arc<dyn CredentialPool>,
    orchestrator: Arc<CampaignOrchestrator>,
    config: MaintenanceConfig,
}

#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "maintenance task panicked");
            }
        }
    }
}

impl Maintenance {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        credentials: Arc<dyn CredentialPool>,
        orchestrator: Arc<CampaignOrchestrator>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            queue,
            credentials,
            orchestrator,
            config,
        }
    }

    /// Return timed-out leases to `pending`.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, QueueError> {
        let timeout = chrono::Duration::from_std(self.config.lease_timeout)
            .map_err(|e| QueueError::Storage(format!("lease timeout out of range: {e}")))?;
        let reaped = self.queue.reap_stale_leases(timeout, now).await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "recovered stale leases");
        }
        Ok(reaped)
    }

    pub async fn reset_once(&self, today: NaiveDate) -> Result<u64, PoolError> {
        let reset = self.credentials.reset_daily(today).await?;
        if reset > 0 {
            info!(%today, reset, "credential quotas reset");
        }
        Ok(reset)
    }

    pub async fn monitor_once(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, OrchestratorError> {
        self.orchestrator.check_all(now).await
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> MaintenanceHandle {
        let reaper = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.reap_loop(shutdown).await })
        };
        let reset = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.reset_loop(shutdown).await })
        };
        let monitor = {
            let this = self.clone();
            tokio::spawn(async move { this.monitor_loop(shutdown).await })
        };

        MaintenanceHandle {
            tasks: vec![reaper, reset, monitor],
        }
    }

    async fn reap_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reap_once(Utc::now()).await {
                        error!(error = %err, "lease reaper failed");
                    }
                }
                stop = stopped(&mut shutdown) => if stop { break },
            }
        }
        debug!("lease reaper stopped");
    }

    /// Resets once at startup, then at every UTC day boundary.
    async fn reset_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(err) = self.reset_once(Utc::now().date_naive()).await {
                error!(error = %err, "daily quota reset failed");
            }
            let wait = until_next_utc_day(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                stop = stopped(&mut shutdown) => if stop { break },
            }
        }
        debug!("daily reset task stopped");
    }

    async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.monitor_once(Utc::now()).await {
                        error!(error = %err, "completion monitor failed");
                    }
                }
                stop = stopped(&mut shutdown) => if stop { break },
            }
        }
        debug!("completion monitor stopped");
    }
}

/// Resolves on the next shutdown-channel change: `true` when the loop should exit.
async fn stopped(shutdown: &mut watch::Receiver<bool>) -> bool {
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}

/// Time from `now` to the next UTC midnight, plus a second of slack.
fn until_next_utc_day(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 1))
        .map(|dt| dt.and_utc());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(60 * 60),
    }
}
