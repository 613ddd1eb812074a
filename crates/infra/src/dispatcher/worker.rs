//! Dispatcher worker pool: N tokio tasks pulling from the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{CycleOutcome, Dispatcher, DispatcherStats, DispatcherStatsSnapshot};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent worker tasks.
    pub workers: usize,
    /// Shortest idle sleep; also the pause after a deferred job.
    pub poll_interval: Duration,
    /// Longest idle sleep.
    pub max_idle_backoff: Duration,
    /// Fraction (0.0-1.0) of each idle sleep randomly added or removed.
    pub idle_jitter: f64,
    /// Per-worker pause after each send attempt, to pace outgoing mail.
    pub send_pause: Duration,
    /// Prefix for worker names in logs.
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            max_idle_backoff: Duration::from_secs(30),
            idle_jitter: 0.2,
            send_pause: Duration::from_secs(1),
            name: "dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_idle_backoff(mut self, max: Duration) -> Self {
        self.max_idle_backoff = max;
        self
    }

    pub fn with_idle_jitter(mut self, jitter: f64) -> Self {
        self.idle_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_send_pause(mut self, pause: Duration) -> Self {
        self.send_pause = pause;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Exponential idle backoff from `poll_interval` to `max_idle_backoff`.
#[derive(Debug, Clone)]
struct IdleBackoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl IdleBackoff {
    fn new(config: &DispatcherConfig) -> Self {
        let max = config.max_idle_backoff.max(config.poll_interval);
        Self {
            min: config.poll_interval,
            max,
            jitter: config.idle_jitter,
            current: config.poll_interval,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let base_ms = base.as_millis() as f64;
        let range = base_ms * self.jitter;
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((base_ms + jitter).max(1.0) as u64)
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// What a worker waits for before its next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    None,
    /// Cut short by new work.
    Idle(Duration),
    /// Only shutdown cuts it short.
    Throttle(Duration),
}

impl Pause {
    fn after(outcome: &CycleOutcome, config: &DispatcherConfig, backoff: &mut IdleBackoff) -> Self {
        match outcome {
            CycleOutcome::Idle => Pause::Idle(backoff.next_delay()),
            CycleOutcome::Deferred => {
                backoff.reset();
                Pause::Idle(config.poll_interval)
            }
            CycleOutcome::Sent | CycleOutcome::Retrying { .. } | CycleOutcome::Dead { .. } => {
                backoff.reset();
                if config.send_pause.is_zero() {
                    Pause::None
                } else {
                    Pause::Throttle(config.send_pause)
                }
            }
            CycleOutcome::Abandoned { .. } | CycleOutcome::LeaseLost => {
                backoff.reset();
                Pause::None
            }
        }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct DispatcherHandle {
    workers: Vec<JoinHandle<()>>,
    stats: Arc<DispatcherStats>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to stop. Signal shutdown first.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "dispatcher worker panicked");
            }
        }
    }
}

impl Dispatcher {
    /// Spawn `config.workers` tasks. They stop after their current cycle once
    /// `shutdown` turns `true` (or its sender is dropped).
    pub fn spawn(
        self: Arc<Self>,
        config: DispatcherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> DispatcherHandle {
        let workers = (0..config.workers.max(1))
            .map(|i| {
                let dispatcher = self.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();
                let name = format!("{}-{i}", config.name);
                tokio::spawn(async move { dispatcher.worker_loop(name, config, shutdown).await })
            })
            .collect();

        DispatcherHandle {
            workers,
            stats: self.stats.clone(),
        }
    }

    async fn worker_loop(
        &self,
        name: String,
        config: DispatcherConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(worker = %name, "dispatcher worker started");
        let mut backoff = IdleBackoff::new(&config);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once(Utc::now()).await {
                Ok(outcome) => Pause::after(&outcome, &config, &mut backoff),
                Err(err) => {
                    self.stats.record_error();
                    error!(worker = %name, error = %err, "dispatch cycle failed");
                    Pause::Idle(backoff.next_delay())
                }
            };

            match pause {
                Pause::None => continue,
                Pause::Idle(pause) => {
                    debug!(worker = %name, pause_ms = pause.as_millis() as u64, "worker idle");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = self.wake.notified() => backoff.reset(),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Pause::Throttle(pause) => {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        info!(worker = %name, "dispatcher worker stopped");
    }
}
