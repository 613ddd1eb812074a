//! Postgres-backed credential pool (`smtp_credentials`).

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use outreach_campaigns::{Credential, CredentialChanges};
use outreach_core::CredentialId;

use super::pool::{Acquisition, CredentialPool, PoolError, Reservation};
use crate::db::{describe, is_unique_violation, non_negative};

const CREDENTIAL_COLUMNS: &str = "id, name, provider, host, port, username, password, \
     encryption, daily_limit, daily_sent, last_reset_date, is_active, created_at";

#[derive(Debug, Clone)]
pub struct PostgresCredentialPool {
    pool: PgPool,
}

impl PostgresCredentialPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialPool for PostgresCredentialPool {
    #[instrument(skip(self, credential), fields(credential_id = %credential.id), err)]
    async fn register(&self, credential: Credential) -> Result<(), PoolError> {
        sqlx::query(
            r#"
            INSERT INTO smtp_credentials
                (id, name, provider, host, port, username, password, encryption,
                 daily_limit, daily_sent, last_reset_date, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(credential.id.as_uuid())
        .bind(&credential.name)
        .bind(&credential.provider)
        .bind(&credential.host)
        .bind(i32::from(credential.port))
        .bind(&credential.username)
        .bind(&credential.password)
        .bind(credential.encryption.as_str())
        .bind(credential.daily_limit as i32)
        .bind(credential.daily_sent as i32)
        .bind(credential.last_reset_date)
        .bind(credential.is_active)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PoolError::Duplicate(credential.id)
            } else {
                map_sqlx_error("register", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: CredentialId) -> Result<Option<Credential>, PoolError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM smtp_credentials WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_credential(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<Credential>, PoolError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM smtp_credentials ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode_credential).collect()
    }

    /// The row stays locked between validation and write, so a concurrent
    /// `acquire` sees either the old or the new limit.
    #[instrument(skip(self, changes), err)]
    async fn update(&self, id: CredentialId, changes: CredentialChanges) -> Result<Credential, PoolError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update.begin", e))?;

        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM smtp_credentials WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update.lock", e))?
            .ok_or(PoolError::NotFound(id))?;
        let mut credential = decode_credential(&row)?;
        credential
            .update(changes)
            .map_err(|e| PoolError::Invalid(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE smtp_credentials
            SET name = $2, provider = $3, host = $4, port = $5, username = $6, password = $7,
                encryption = $8, daily_limit = $9, daily_sent = $10, is_active = $11
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&credential.name)
        .bind(&credential.provider)
        .bind(&credential.host)
        .bind(i32::from(credential.port))
        .bind(&credential.username)
        .bind(&credential.password)
        .bind(credential.encryption.as_str())
        .bind(credential.daily_limit as i32)
        .bind(credential.daily_sent as i32)
        .bind(credential.is_active)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update.write", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update.commit", e))?;
        Ok(credential)
    }

    /// Sent queue rows keep their history; `credential_id` is set to NULL.
    #[instrument(skip(self), err)]
    async fn remove(&self, id: CredentialId) -> Result<(), PoolError> {
        let result = sqlx::query("DELETE FROM smtp_credentials WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        if result.rows_affected() == 0 {
            return Err(PoolError::NotFound(id));
        }
        debug!(credential_id = %id, "credential removed");
        Ok(())
    }

    /// Under contention `SKIP LOCKED` may pass over a locked best candidate
    /// and reserve from the next-best one.
    #[instrument(skip(self), err)]
    async fn acquire(&self) -> Result<Acquisition, PoolError> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT id
                FROM smtp_credentials
                WHERE is_active AND daily_sent < daily_limit
                ORDER BY (daily_limit - daily_sent) DESC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE smtp_credentials c
            SET daily_sent = c.daily_sent + 1
            FROM candidate
            WHERE c.id = candidate.id AND c.daily_sent < c.daily_limit
            RETURNING {}
            "#,
            prefixed_columns("c")
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;

        match row {
            Some(row) => {
                let credential = decode_credential(&row)?;
                Ok(Acquisition::Reserved(Reservation {
                    reserved_on: credential.last_reset_date,
                    credential,
                }))
            }
            None => Ok(Acquisition::Unavailable),
        }
    }

    #[instrument(skip(self, reservation), fields(credential_id = %reservation.credential_id()), err)]
    async fn release(&self, reservation: &Reservation, used: bool) -> Result<(), PoolError> {
        if used {
            return Ok(());
        }
        // Checked against the current row: a refund after a reset is ignored.
        sqlx::query(
            r#"
            UPDATE smtp_credentials
            SET daily_sent = daily_sent - 1
            WHERE id = $1 AND last_reset_date = $2 AND daily_sent > 0
            "#,
        )
        .bind(reservation.credential_id().as_uuid())
        .bind(reservation.reserved_on)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reset_daily(&self, today: NaiveDate) -> Result<u64, PoolError> {
        let result = sqlx::query(
            r#"
            UPDATE smtp_credentials
            SET daily_sent = 0, last_reset_date = $1
            WHERE last_reset_date < $1
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_daily", e))?;
        Ok(result.rows_affected())
    }
}

fn prefixed_columns(alias: &str) -> String {
    CREDENTIAL_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PoolError {
    PoolError::Storage(describe(operation, &err))
}

fn decode_credential(row: &PgRow) -> Result<Credential, PoolError> {
    let decode = || -> Result<Credential, sqlx::Error> {
        let encryption: String = row.try_get("encryption")?;
        Ok(Credential {
            id: CredentialId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            provider: row.try_get("provider")?,
            host: row.try_get("host")?,
            port: non_negative(i64::from(row.try_get::<i32, _>("port")?), "port")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            encryption: encryption
                .parse()
                .map_err(|e: outreach_core::DomainError| sqlx::Error::Decode(e.to_string().into()))?,
            daily_limit: non_negative(i64::from(row.try_get::<i32, _>("daily_limit")?), "daily_limit")?,
            daily_sent: non_negative(i64::from(row.try_get::<i32, _>("daily_sent")?), "daily_sent")?,
            last_reset_date: row.try_get("last_reset_date")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_credential", e))
}
