//! Postgres-backed queue store (`email_queue`).
//!
//! Leasing selects with `FOR UPDATE SKIP LOCKED`, so concurrent workers in
//! any number of processes never claim the same row. State changes are
//! computed by the same [`QueueJob`] methods the in-memory store uses, inside
//! the transaction holding the row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use outreach_core::{CampaignId, CredentialId, JobId, RecipientId};

use super::store::{QueueError, QueueStats, QueueStore};
use super::types::{Completion, JobOutcome, JobStatus, LeaseId, QueueJob, RetryPolicy};
use crate::db::{describe, non_negative};

const JOB_COLUMNS: &str = "id, campaign_id, recipient_id, priority, status, retry_count, \
     max_retries, scheduled_for, lease_id, leased_at, credential_id, sent_at, last_error, \
     dead_reason, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<QueueJob>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM email_queue WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    async fn write_job(
        tx: &mut Transaction<'_, Postgres>,
        job: &QueueJob,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = $2,
                retry_count = $3,
                scheduled_for = $4,
                lease_id = $5,
                leased_at = $6,
                credential_id = $7,
                sent_at = $8,
                last_error = $9,
                dead_reason = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.scheduled_for)
        .bind(job.lease_id.map(|l| *l.as_uuid()))
        .bind(job.leased_at)
        .bind(job.credential_id.map(Uuid::from))
        .bind(job.sent_at)
        .bind(job.last_error.as_deref())
        .bind(job.dead_reason.map(|r| r.as_str()))
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_job", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self), err)]
    async fn enqueue(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        priority: i32,
        scheduled_for: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        let job = QueueJob::new(
            campaign_id,
            recipient_id,
            priority,
            self.policy.max_retries,
            scheduled_for,
            Utc::now(),
        );

        let inserted = sqlx::query(
            r#"
            INSERT INTO email_queue
                (id, campaign_id, recipient_id, priority, status, retry_count, max_retries,
                 scheduled_for, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $7)
            ON CONFLICT (campaign_id, recipient_id) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(campaign_id.as_uuid())
        .bind(recipient_id.as_uuid())
        .bind(priority)
        .bind(job.max_retries as i32)
        .bind(scheduled_for)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(job.id);
        }

        let existing: Uuid = sqlx::query_scalar(
            "SELECT id FROM email_queue WHERE campaign_id = $1 AND recipient_id = $2",
        )
        .bind(campaign_id.as_uuid())
        .bind(recipient_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Err(QueueError::DuplicateJob {
            job_id: JobId::from_uuid(existing),
        })
    }

    #[instrument(skip(self), err)]
    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<QueueJob>, QueueError> {
        let mut tx = self.begin("lease_next").await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM email_queue
            WHERE status IN ('pending', 'failed') AND scheduled_for <= $1
            ORDER BY priority DESC, scheduled_for ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lease_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = decode_job(&row)?;
        job.lease(now)?;
        Self::write_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("lease_next", e))?;
        debug!(job_id = %job.id, "leased job");
        Ok(Some(job))
    }

    #[instrument(skip(self, outcome), err)]
    async fn complete_job(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion, QueueError> {
        let mut tx = self.begin("complete_job").await?;

        let mut job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        if !job.holds_lease(lease_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        let completion = job.apply_outcome(outcome, &self.policy, now)?;
        Self::write_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?;
        Ok(completion)
    }

    #[instrument(skip(self), err)]
    async fn reap_stale_leases(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut tx = self.begin("reap_stale_leases").await?;

        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM email_queue
            WHERE status = 'in_flight' AND leased_at < $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now - timeout)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reap_stale_leases", e))?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = decode_job(&row)?;
            job.release_stale(now)?;
            Self::write_job(&mut tx, &job).await?;
            reaped.push(job.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("reap_stale_leases", e))?;
        Ok(reaped)
    }

    #[instrument(skip(self), err)]
    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'dead', dead_reason = 'cancelled', updated_at = $2
            WHERE campaign_id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(campaign_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_pending", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM email_queue WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<QueueJob>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM email_queue WHERE campaign_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(campaign_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_campaign", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn campaign_stats(&self, campaign_id: CampaignId) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM email_queue WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("campaign_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("campaign_stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("campaign_stats", e))?;
            let status: JobStatus = status.parse()?;
            stats.add(status, n.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Unique violations cannot reach the caller as duplicates here: `enqueue`
/// uses `ON CONFLICT DO NOTHING` and resolves the existing id itself.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(describe(operation, &err))
}

fn decode_job(row: &PgRow) -> Result<QueueJob, QueueError> {
    let decode = || -> Result<QueueJob, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let dead_reason: Option<String> = row.try_get("dead_reason")?;
        let parse_err = |e: outreach_core::DomainError| sqlx::Error::Decode(e.to_string().into());

        Ok(QueueJob {
            id: JobId::from_uuid(row.try_get("id")?),
            campaign_id: CampaignId::from_uuid(row.try_get("campaign_id")?),
            recipient_id: RecipientId::from_uuid(row.try_get("recipient_id")?),
            priority: row.try_get("priority")?,
            status: status.parse().map_err(parse_err)?,
            retry_count: non_negative(i64::from(row.try_get::<i32, _>("retry_count")?), "retry_count")?,
            max_retries: non_negative(i64::from(row.try_get::<i32, _>("max_retries")?), "max_retries")?,
            scheduled_for: row.try_get("scheduled_for")?,
            lease_id: row.try_get::<Option<Uuid>, _>("lease_id")?.map(LeaseId::from_uuid),
            leased_at: row.try_get("leased_at")?,
            credential_id: row
                .try_get::<Option<Uuid>, _>("credential_id")?
                .map(CredentialId::from_uuid),
            sent_at: row.try_get("sent_at")?,
            last_error: row.try_get("last_error")?,
            dead_reason: dead_reason.map(|r| r.parse()).transpose().map_err(parse_err)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_job", e))
}
