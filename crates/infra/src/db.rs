//! Postgres connection pool and schema bootstrap.
//!
//! Every Postgres store in this crate maps `sqlx` errors the same way:
//!
//! | SQLx Error | PostgreSQL Code | Mapped to |
//! |------------|-----------------|-----------|
//! | Database (unique violation) | `23505` | the store's duplicate / conflict variant |
//! | Database (foreign key violation) | `23503` | `InUse` where a delete is blocked |
//! | Database (other) | any | `Storage` |
//! | PoolClosed, Io, Tls, Protocol | N/A | `Storage` |
//! | RowNotFound | N/A | `Storage` (queries use `fetch_optional`) |

use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("schema.sql");

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres - check DATABASE_URL")?;
    info!(max_connections, "connected to Postgres");
    Ok(pool)
}

/// Create missing tables and indexes.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to bootstrap database schema")?;
    info!("database schema ready");
    Ok(())
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23503")
}

fn has_sqlstate(err: &sqlx::Error, sqlstate: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == sqlstate;
        }
    }
    false
}

/// Human-readable description of a sqlx failure, tagged with the operation.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {operation}: {}", db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

/// Convert a non-negative database integer, rejecting corrupt rows.
pub(crate) fn non_negative<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, sqlx::Error> {
    T::try_from(value).map_err(|_| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("negative or out-of-range value {value}").into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let statement = statement
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            if statement.trim().is_empty() {
                continue;
            }
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement is not idempotent: {statement}"
            );
        }
    }

    #[test]
    fn describes_pool_errors() {
        let msg = describe("lease_next", &sqlx::Error::PoolClosed);
        assert_eq!(msg, "connection pool closed in lease_next");
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
        assert!(!is_foreign_key_violation(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn rejects_negative_counts() {
        assert_eq!(non_negative::<u32>(3, "retry_count").unwrap(), 3);
        assert!(non_negative::<u32>(-1, "retry_count").is_err());
    }
}
