//! End-to-end delivery tests on the in-memory stores.
//!
//! Campaign launch → queue → dispatcher → transport → tracking → counters,
//! with a scripted transport standing in for SMTP.
//!
//! Verifies:
//! - Each recipient is counted sent at most once
//! - Credential quotas are never exceeded; over-quota jobs stay pending
//! - Transient failures retry up to the limit, then bounce the recipient
//! - Cancellation stops pending work but lets in-flight sends finish
//! - A stuck send gives up before its lease can be reaped
//! - An unrenderable template postpones jobs without bouncing anyone

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value as JsonValue;
    use tokio::sync::{Notify, Semaphore};

    use outreach_campaigns::{
        CampaignStatus, Credential, Encryption, Lead, LeadEmail, LeadFilter, NewCredential,
        RenderedMessage, Template, TrackingEventType,
    };
    use outreach_core::{CampaignId, LeadId};

    use crate::credentials::{CredentialPool, InMemoryCredentialPool};
    use crate::dispatcher::{
        CycleOutcome, Dispatcher, MailTransport, RenderError, SendError, TemplateRenderer,
    };
    use crate::maintenance::{Maintenance, MaintenanceConfig};
    use crate::orchestrator::{CampaignOrchestrator, NewCampaign};
    use crate::queue::{DeadReason, InMemoryQueueStore, JobStatus, QueueStore, RetryPolicy};
    use crate::repository::{CampaignStore, InMemoryRepository, RecipientStore, TemplateStore};
    use crate::tracking::{InMemoryTrackingLog, TrackingRecorder};

    /// Replays scripted results, then `fallback` forever.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        fallback: Result<(), SendError>,
        delivered: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn always(result: Result<(), SendError>) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: result,
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(
            &self,
            _credential: &Credential,
            to: &str,
            _message: &RenderedMessage,
        ) -> Result<(), SendError> {
            let result = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            if result.is_ok() {
                self.delivered.lock().unwrap().push(to.to_string());
            }
            result
        }
    }

    /// Blocks every send until a permit is added.
    struct GatedTransport {
        gate: Semaphore,
        entered: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedTransport {
        fn closed() -> Self {
            Self {
                gate: Semaphore::new(0),
                entered: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    /// Decrements `active` when a send finishes or is dropped mid-flight.
    struct ActiveSend<'a>(&'a AtomicUsize);

    impl Drop for ActiveSend<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MailTransport for GatedTransport {
        async fn send(
            &self,
            _credential: &Credential,
            _to: &str,
            _message: &RenderedMessage,
        ) -> Result<(), SendError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let _active = ActiveSend(&self.active);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SendError::Transient(e.to_string()))?;
            permit.forget();
            Ok(())
        }
    }

    struct Engine {
        repo: Arc<InMemoryRepository>,
        queue: Arc<InMemoryQueueStore>,
        pool: Arc<InMemoryCredentialPool>,
        recorder: Arc<TrackingRecorder>,
        orchestrator: Arc<CampaignOrchestrator>,
        dispatcher: Arc<Dispatcher>,
    }

    fn engine(transport: Arc<dyn MailTransport>) -> Engine {
        engine_with(transport, |d| d)
    }

    fn engine_with(
        transport: Arc<dyn MailTransport>,
        configure: impl FnOnce(Dispatcher) -> Dispatcher,
    ) -> Engine {
        let repo = Arc::new(InMemoryRepository::new());
        let queue = Arc::new(InMemoryQueueStore::new(RetryPolicy::exponential(
            3,
            Duration::ZERO,
            Duration::ZERO,
        )));
        let pool = Arc::new(InMemoryCredentialPool::new());
        let recorder = Arc::new(TrackingRecorder::new(
            Arc::new(InMemoryTrackingLog::new()),
            repo.clone(),
            repo.clone(),
        ));
        let wake = Arc::new(Notify::new());

        let orchestrator = Arc::new(CampaignOrchestrator::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            queue.clone(),
            wake.clone(),
        ));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            pool.clone(),
            repo.clone(),
            repo.clone(),
            Arc::new(TemplateRenderer::new(repo.clone(), Some("https://t.example.test".into()))),
            transport,
            recorder.clone(),
        )
        .with_wake(wake);
        let dispatcher = configure(dispatcher);

        Engine {
            repo,
            queue,
            pool,
            recorder,
            orchestrator,
            dispatcher: Arc::new(dispatcher),
        }
    }

    fn lead(n: usize) -> Lead {
        Lead {
            id: LeadId::new(),
            company_name: Some(format!("Company {n}")),
            first_name: Some(format!("Lead{n}")),
            last_name: None,
            industry: Some("software".into()),
            city: None,
            state: None,
            country: None,
            company_size: None,
            status: None,
            source: None,
            tags: vec![],
            quality_score: None,
            emails: vec![LeadEmail {
                address: format!("lead{n}@example.test"),
                is_primary: true,
                is_validated: true,
            }],
        }
    }

    async fn add_credential(e: &Engine, daily_limit: u32) -> Credential {
        let credential = Credential::new(
            NewCredential {
                name: "primary".into(),
                provider: "smtp".into(),
                host: "smtp.example.test".into(),
                port: 587,
                username: "sender".into(),
                password: "secret".into(),
                encryption: Encryption::Tls,
                daily_limit: Some(daily_limit),
            },
            200,
            Utc::now().date_naive(),
            Utc::now(),
        )
        .unwrap();
        e.pool.register(credential.clone()).await.unwrap();
        credential
    }

    /// Seed `leads` leads and a template, then create and launch a campaign.
    async fn launched(e: &Engine, leads: usize, now: DateTime<Utc>) -> CampaignId {
        for n in 0..leads {
            e.repo.add_lead(lead(n)).unwrap();
        }
        let template = Template::new(
            "intro",
            "Hello {{first_name}}",
            "<p>Hi {{first_name}} at {{company_name}}</p>",
            vec![],
            now,
        )
        .unwrap();
        e.repo.insert_template(&template).await.unwrap();

        let campaign = e
            .orchestrator
            .create_campaign(
                NewCampaign {
                    name: "autumn".into(),
                    template_id: template.id,
                    subject: None,
                    target_filter: LeadFilter::default(),
                    scheduled_at: None,
                },
                now,
            )
            .await
            .unwrap();
        e.orchestrator.launch(campaign.id, now).await.unwrap();
        campaign.id
    }

    async fn drain(e: &Engine, now: DateTime<Utc>) -> Vec<CycleOutcome> {
        let mut outcomes = Vec::new();
        loop {
            match e.dispatcher.run_once(now).await.unwrap() {
                CycleOutcome::Idle => return outcomes,
                outcome => outcomes.push(outcome),
            }
        }
    }

    #[tokio::test]
    async fn every_recipient_is_sent_once_and_the_campaign_completes() {
        let transport = Arc::new(ScriptedTransport::always(Ok(())));
        let e = engine(transport.clone());
        add_credential(&e, 100).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 4, now).await;

        let outcomes = drain(&e, now).await;
        assert_eq!(outcomes, vec![CycleOutcome::Sent; 4]);

        let mut delivered = transport.delivered();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 4);

        let counters = e.repo.campaign_counters(campaign_id).await.unwrap();
        let campaign = e.repo.get_campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(counters.sent, 4);
        assert!(counters.sent <= campaign.total_recipients);
        assert!(e
            .repo
            .list_recipients(campaign_id)
            .await
            .unwrap()
            .iter()
            .all(|r| r.sent_at.is_some()));

        let reconciliation = e.recorder.reconcile(campaign_id).await.unwrap();
        assert!(reconciliation.consistent);
        assert_eq!(reconciliation.derived.sent, 4);

        assert_eq!(e.orchestrator.check_all(now).await.unwrap(), vec![campaign_id]);
        let campaign = e.repo.get_campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(e.dispatcher.stats().snapshot().sent, 4);
    }

    #[tokio::test]
    async fn enqueueing_a_recipient_twice_yields_one_job() {
        let e = engine(Arc::new(ScriptedTransport::always(Ok(()))));
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;
        let recipient = e.repo.list_recipients(campaign_id).await.unwrap().remove(0);

        let again = e.queue.enqueue(campaign_id, recipient.id, 0, now).await;
        assert!(matches!(again, Err(crate::queue::QueueError::DuplicateJob { .. })));
        assert_eq!(e.queue.list_by_campaign(campaign_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replayed_open_pixel_counts_once() {
        let e = engine(Arc::new(ScriptedTransport::always(Ok(()))));
        add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;
        drain(&e, now).await;

        let recipient = e.repo.list_recipients(campaign_id).await.unwrap().remove(0);
        for _ in 0..2 {
            e.recorder
                .record_by_tracking_id(
                    recipient.tracking_id.as_str(),
                    TrackingEventType::Opened,
                    JsonValue::Null,
                    Some("203.0.113.7".into()),
                    Some("Mail/1.0".into()),
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        let counters = e.repo.campaign_counters(campaign_id).await.unwrap();
        assert_eq!(counters.opened, 1);
        assert_eq!(counters.sent, 1);
        assert!(e.recorder.reconcile(campaign_id).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_bounce() {
        let e = engine(Arc::new(ScriptedTransport::always(Err(SendError::Transient(
            "421 try again later".into(),
        )))));
        let credential = add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;
        let recipient_id = e.repo.list_recipients(campaign_id).await.unwrap()[0].id;

        for attempt in 1..=3u32 {
            let outcome = e.dispatcher.run_once(now).await.unwrap();
            assert!(matches!(outcome, CycleOutcome::Retrying { .. }), "attempt {attempt}: {outcome:?}");

            let job = &e.queue.list_by_campaign(campaign_id).await.unwrap()[0];
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, attempt);
            let recipient = e.repo.get_recipient(recipient_id).await.unwrap().unwrap();
            assert!(!recipient.is_bounced());
        }

        let outcome = e.dispatcher.run_once(now).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Dead {
                reason: DeadReason::RetriesExhausted
            }
        );
        let job = &e.queue.list_by_campaign(campaign_id).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.retry_count, 4);

        let recipient = e.repo.get_recipient(recipient_id).await.unwrap().unwrap();
        assert!(recipient.is_bounced());
        assert!(recipient.sent_at.is_none());
        assert!(recipient
            .bounce_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("retries exhausted")));
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().bounced, 1);

        // Every failed attempt refunded its reservation.
        let stored = e.pool.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.daily_sent, 0);
        assert_eq!(e.dispatcher.run_once(now).await.unwrap(), CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn permanent_failure_bounces_immediately() {
        let e = engine(Arc::new(ScriptedTransport::always(Err(SendError::Permanent(
            "550 mailbox unavailable".into(),
        )))));
        add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;

        assert_eq!(
            e.dispatcher.run_once(now).await.unwrap(),
            CycleOutcome::Dead {
                reason: DeadReason::PermanentFailure
            }
        );
        let recipient = e.repo.list_recipients(campaign_id).await.unwrap().remove(0);
        assert_eq!(recipient.bounce_reason.as_deref(), Some("550 mailbox unavailable"));
    }

    #[tokio::test]
    async fn daily_limit_leaves_the_rest_pending() {
        let e = engine(Arc::new(ScriptedTransport::always(Ok(()))));
        let credential = add_credential(&e, 2).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 3, now).await;

        let outcomes = vec![
            e.dispatcher.run_once(now).await.unwrap(),
            e.dispatcher.run_once(now).await.unwrap(),
            e.dispatcher.run_once(now).await.unwrap(),
        ];
        assert_eq!(
            outcomes,
            vec![CycleOutcome::Sent, CycleOutcome::Sent, CycleOutcome::Deferred]
        );

        let stats = e.queue.campaign_stats(campaign_id).await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.pending, 1);
        let stored = e.pool.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.daily_sent, 2);
        assert!(stored.daily_sent <= stored.daily_limit);

        // Deferral is not a failure.
        let pending = e
            .queue
            .list_by_campaign(campaign_id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.status == JobStatus::Pending)
            .unwrap();
        assert_eq!(pending.retry_count, 0);

        let tomorrow = now.date_naive().succ_opt().unwrap();
        assert_eq!(e.pool.reset_daily(tomorrow).await.unwrap(), 1);
        assert_eq!(e.dispatcher.run_once(now).await.unwrap(), CycleOutcome::Sent);
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().sent, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_are_exclusive() {
        let e = engine(Arc::new(ScriptedTransport::always(Ok(()))));
        let now = Utc::now();
        launched(&e, 1, now).await;

        let queue = e.queue.clone();
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.lease_next(now).await.unwrap() })
            })
            .collect();

        let mut leased = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                leased += 1;
            }
        }
        assert_eq!(leased, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_stops_pending_jobs_but_in_flight_sends_finish() {
        let transport = Arc::new(GatedTransport::closed());
        let e = engine(transport.clone());
        add_credential(&e, 100).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 7, now).await;

        let in_flight: Vec<_> = (0..2)
            .map(|_| {
                let dispatcher = e.dispatcher.clone();
                tokio::spawn(async move { dispatcher.run_once(now).await.unwrap() })
            })
            .collect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.entered.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sends did not start");

        let report = e.orchestrator.cancel(campaign_id, Utc::now()).await.unwrap();
        assert_eq!(report.cancelled_jobs, 5);
        assert_eq!(report.campaign.status, CampaignStatus::Cancelled);

        transport.gate.add_permits(2);
        for task in in_flight {
            assert_eq!(task.await.unwrap(), CycleOutcome::Sent);
        }

        let stats = e.queue.campaign_stats(campaign_id).await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dead, 5);
        assert_eq!(stats.pending + stats.in_flight, 0);

        let jobs = e.queue.list_by_campaign(campaign_id).await.unwrap();
        assert!(jobs
            .iter()
            .filter(|j| j.status == JobStatus::Dead)
            .all(|j| j.dead_reason == Some(DeadReason::Cancelled)));
        let recipients = e.repo.list_recipients(campaign_id).await.unwrap();
        assert!(recipients.iter().all(|r| !r.is_bounced()));
        assert_eq!(recipients.iter().filter(|r| r.sent_at.is_some()).count(), 2);

        assert_eq!(e.dispatcher.run_once(Utc::now()).await.unwrap(), CycleOutcome::Idle);
        assert!(e.orchestrator.check_all(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_send_times_out_before_its_lease_is_reaped() {
        let transport = Arc::new(GatedTransport::closed());
        let e = engine_with(transport.clone(), |d| {
            d.with_send_timeout(Duration::from_millis(50))
        });
        let credential = add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;
        let maintenance = Maintenance::new(
            e.queue.clone(),
            e.pool.clone(),
            e.orchestrator.clone(),
            MaintenanceConfig::default(),
        );

        // The transport never answers; the dispatcher gives up and retries later.
        let outcome = e.dispatcher.run_once(now).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Retrying { .. }), "{outcome:?}");
        assert_eq!(transport.active.load(Ordering::SeqCst), 0);
        let job = &e.queue.list_by_campaign(campaign_id).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.as_deref().is_some_and(|m| m.contains("timed out")));
        assert_eq!(e.pool.get(credential.id).await.unwrap().unwrap().daily_sent, 0);

        // By the time the lease would have expired there is nothing to reap.
        let later = now + chrono::Duration::minutes(6);
        assert!(maintenance.reap_once(later).await.unwrap().is_empty());

        transport.gate.add_permits(1);
        assert_eq!(e.dispatcher.run_once(later).await.unwrap(), CycleOutcome::Sent);
        assert_eq!(e.dispatcher.run_once(later).await.unwrap(), CycleOutcome::Idle);

        assert_eq!(transport.entered.load(Ordering::SeqCst), 2);
        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().sent, 1);
        assert_eq!(e.pool.get(credential.id).await.unwrap().unwrap().daily_sent, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reaper_returns_an_abandoned_lease_to_the_dispatcher() {
        let transport = Arc::new(ScriptedTransport::always(Ok(())));
        let e = engine(transport.clone());
        add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 1, now).await;
        let maintenance = Maintenance::new(
            e.queue.clone(),
            e.pool.clone(),
            e.orchestrator.clone(),
            MaintenanceConfig::default(),
        );

        // A worker that died after leasing leaves the job in flight.
        let orphan = e.queue.lease_next(now).await.unwrap().unwrap();
        assert_eq!(e.dispatcher.run_once(now).await.unwrap(), CycleOutcome::Idle);
        assert!(maintenance
            .reap_once(now + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());

        let later = now + chrono::Duration::minutes(6);
        assert_eq!(maintenance.reap_once(later).await.unwrap(), vec![orphan.id]);
        assert_eq!(e.dispatcher.run_once(later).await.unwrap(), CycleOutcome::Sent);

        let job = e.queue.get(orphan.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.retry_count, 0);
        assert_eq!(transport.delivered().len(), 1);
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn inactive_template_postpones_without_bouncing() {
        let transport = Arc::new(ScriptedTransport::always(Ok(())));
        let e = engine(transport.clone());
        let credential = add_credential(&e, 10).await;
        let now = Utc::now();
        let campaign_id = launched(&e, 2, now).await;

        let template_id = e
            .repo
            .get_campaign(campaign_id)
            .await
            .unwrap()
            .unwrap()
            .template_id
            .unwrap();
        let mut template = e.repo.get_template(template_id).await.unwrap().unwrap();
        template.is_active = false;
        e.repo.update_template(&template).await.unwrap();

        // Postponing never spends a retry, however often it happens.
        for _ in 0..2 {
            assert_eq!(e.dispatcher.run_once(now).await.unwrap(), CycleOutcome::Deferred);
        }
        assert_eq!(e.dispatcher.run_once(now).await.unwrap(), CycleOutcome::Idle);
        let much_later = now + chrono::Duration::hours(1);
        for _ in 0..8 {
            let outcome = e.dispatcher.run_once(much_later).await.unwrap();
            assert!(matches!(outcome, CycleOutcome::Deferred | CycleOutcome::Idle), "{outcome:?}");
            if outcome == CycleOutcome::Idle {
                break;
            }
        }

        let inactive = RenderError::TemplateInactive(template_id).to_string();
        for job in e.queue.list_by_campaign(campaign_id).await.unwrap() {
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, 0);
            assert_eq!(job.last_error.as_deref(), Some(inactive.as_str()));
        }
        let recipients = e.repo.list_recipients(campaign_id).await.unwrap();
        assert!(recipients.iter().all(|r| !r.is_bounced()));
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().bounced, 0);
        assert_eq!(e.pool.get(credential.id).await.unwrap().unwrap().daily_sent, 0);
        assert!(transport.delivered().is_empty());

        template.is_active = true;
        e.repo.update_template(&template).await.unwrap();
        let outcomes = drain(&e, much_later + chrono::Duration::hours(1)).await;
        assert_eq!(outcomes, vec![CycleOutcome::Sent; 2]);
        assert_eq!(e.repo.campaign_counters(campaign_id).await.unwrap().sent, 2);
    }

    #[tokio::test]
    async fn unknown_tracking_id_is_rejected() {
        let e = engine(Arc::new(ScriptedTransport::always(Ok(()))));
        let err = e
            .recorder
            .record_by_tracking_id(
                "does-not-exist",
                TrackingEventType::Opened,
                JsonValue::Null,
                None,
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::tracking::TrackingError::UnknownRecipient(_)));
    }
}
