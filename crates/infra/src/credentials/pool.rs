//! Credential pool: quota reservation across sending credentials.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;

use outreach_campaigns::{Credential, CredentialChanges};
use outreach_core::CredentialId;

/// One unit of quota taken from a credential.
///
/// Carries the quota day it was taken on so a refund after a daily reset is
/// ignored instead of opening extra quota on the new day.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub credential: Credential,
    pub reserved_on: NaiveDate,
}

impl Reservation {
    pub fn credential_id(&self) -> CredentialId {
        self.credential.id
    }
}

#[derive(Debug, Clone)]
pub enum Acquisition {
    Reserved(Reservation),
    /// No active credential has quota left today.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("credential not found: {0}")]
    NotFound(CredentialId),
    #[error("credential already registered: {0}")]
    Duplicate(CredentialId),
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<PoisonError<T>> for PoolError {
    fn from(_: PoisonError<T>) -> Self {
        PoolError::Storage("credential pool lock poisoned".to_string())
    }
}

/// Fixed set of sending credentials with daily quotas.
///
/// Selection and reservation happen in one atomic step: no two callers can
/// receive the same unit of quota, and `daily_sent` never exceeds
/// `daily_limit`.
#[async_trait]
pub trait CredentialPool: Send + Sync {
    async fn register(&self, credential: Credential) -> Result<(), PoolError>;

    async fn get(&self, id: CredentialId) -> Result<Option<Credential>, PoolError>;

    async fn list(&self) -> Result<Vec<Credential>, PoolError>;

    /// Apply an operator edit to the stored row, atomically with respect to
    /// reservations. Returns the updated credential.
    async fn update(&self, id: CredentialId, changes: CredentialChanges) -> Result<Credential, PoolError>;

    /// Remove a credential. Outstanding reservations against it are dropped
    /// on release.
    async fn remove(&self, id: CredentialId) -> Result<(), PoolError>;

    /// Reserve one unit from the eligible credential with the most remaining
    /// budget (ties go to the lowest id).
    async fn acquire(&self) -> Result<Acquisition, PoolError>;

    /// Commit (`used = true`) or refund a reservation.
    async fn release(&self, reservation: &Reservation, used: bool) -> Result<(), PoolError>;

    /// Zero `daily_sent` for every credential whose quota day predates
    /// `today`. Returns how many were reset.
    async fn reset_daily(&self, today: NaiveDate) -> Result<u64, PoolError>;
}

/// Picks the credential `acquire` should reserve from.
pub fn select_credential<'a>(
    credentials: impl IntoIterator<Item = &'a Credential>,
) -> Option<&'a Credential> {
    credentials
        .into_iter()
        .filter(|c| c.is_eligible())
        .min_by_key(|c| (core::cmp::Reverse(c.remaining()), c.id))
}

/// In-memory pool for tests/dev. A single mutex makes every decision linearizable.
#[derive(Debug, Default)]
pub struct InMemoryCredentialPool {
    credentials: Mutex<BTreeMap<CredentialId, Credential>>,
}

impl InMemoryCredentialPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialPool for InMemoryCredentialPool {
    async fn register(&self, credential: Credential) -> Result<(), PoolError> {
        let mut creds = self.credentials.lock()?;
        if creds.contains_key(&credential.id) {
            return Err(PoolError::Duplicate(credential.id));
        }
        creds.insert(credential.id, credential);
        Ok(())
    }

    async fn get(&self, id: CredentialId) -> Result<Option<Credential>, PoolError> {
        Ok(self.credentials.lock()?.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Credential>, PoolError> {
        Ok(self.credentials.lock()?.values().cloned().collect())
    }

    async fn update(&self, id: CredentialId, changes: CredentialChanges) -> Result<Credential, PoolError> {
        let mut creds = self.credentials.lock()?;
        let stored = creds.get_mut(&id).ok_or(PoolError::NotFound(id))?;
        let mut updated = stored.clone();
        updated
            .update(changes)
            .map_err(|e| PoolError::Invalid(e.to_string()))?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn remove(&self, id: CredentialId) -> Result<(), PoolError> {
        self.credentials
            .lock()?
            .remove(&id)
            .map(|_| ())
            .ok_or(PoolError::NotFound(id))
    }

    async fn acquire(&self) -> Result<Acquisition, PoolError> {
        let mut creds = self.credentials.lock()?;
        let Some(id) = select_credential(creds.values()).map(|c| c.id) else {
            return Ok(Acquisition::Unavailable);
        };
        let credential = creds.get_mut(&id).ok_or(PoolError::NotFound(id))?;
        let reserved_on = credential
            .reserve()
            .map_err(|e| PoolError::Storage(e.to_string()))?;

        Ok(Acquisition::Reserved(Reservation {
            credential: credential.clone(),
            reserved_on,
        }))
    }

    async fn release(&self, reservation: &Reservation, used: bool) -> Result<(), PoolError> {
        if used {
            return Ok(());
        }
        let mut creds = self.credentials.lock()?;
        if let Some(credential) = creds.get_mut(&reservation.credential_id()) {
            credential.refund(reservation.reserved_on);
        }
        Ok(())
    }

    async fn reset_daily(&self, today: NaiveDate) -> Result<u64, PoolError> {
        let mut creds = self.credentials.lock()?;
        let mut reset = 0;
        for credential in creds.values_mut().filter(|c| c.needs_reset(today)) {
            credential.reset(today);
            reset += 1;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use outreach_campaigns::{Encryption, NewCredential};

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    fn credential(name: &str, limit: u32) -> Credential {
        Credential::new(
            NewCredential {
                name: name.into(),
                provider: "smtp".into(),
                host: "smtp.example.test".into(),
                port: 587,
                username: name.into(),
                password: "secret".into(),
                encryption: Encryption::Tls,
                daily_limit: Some(limit),
            },
            200,
            day(1),
            Utc::now(),
        )
        .unwrap()
    }

    fn reserved(a: Acquisition) -> Reservation {
        match a {
            Acquisition::Reserved(r) => r,
            Acquisition::Unavailable => panic!("expected a reservation"),
        }
    }

    #[tokio::test]
    async fn picks_most_remaining_then_lowest_id() {
        let pool = InMemoryCredentialPool::new();
        let small = credential("small", 2);
        let big = credential("big", 5);
        let big_twin = credential("big-twin", 5);
        pool.register(small.clone()).await.unwrap();
        pool.register(big.clone()).await.unwrap();
        pool.register(big_twin.clone()).await.unwrap();

        let (lower, higher) = if big.id < big_twin.id {
            (big.id, big_twin.id)
        } else {
            (big_twin.id, big.id)
        };

        let first = reserved(pool.acquire().await.unwrap());
        assert_eq!(first.credential_id(), lower);

        // `lower` now has 4 left, so the twin with 5 wins.
        let second = reserved(pool.acquire().await.unwrap());
        assert_eq!(second.credential_id(), higher);
    }

    #[tokio::test]
    async fn unavailable_when_quota_is_spent() {
        let pool = InMemoryCredentialPool::new();
        pool.register(credential("only", 1)).await.unwrap();

        reserved(pool.acquire().await.unwrap());
        assert!(matches!(pool.acquire().await.unwrap(), Acquisition::Unavailable));

        assert_eq!(pool.reset_daily(day(2)).await.unwrap(), 1);
        assert_eq!(pool.reset_daily(day(2)).await.unwrap(), 0);
        reserved(pool.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn refund_returns_quota_only_on_the_same_day() {
        let pool = InMemoryCredentialPool::new();
        let c = credential("only", 1);
        pool.register(c.clone()).await.unwrap();

        let r = reserved(pool.acquire().await.unwrap());
        pool.release(&r, false).await.unwrap();
        assert_eq!(pool.get(c.id).await.unwrap().unwrap().daily_sent, 0);

        let r = reserved(pool.acquire().await.unwrap());
        pool.reset_daily(day(2)).await.unwrap();
        reserved(pool.acquire().await.unwrap());
        pool.release(&r, false).await.unwrap();
        assert_eq!(pool.get(c.id).await.unwrap().unwrap().daily_sent, 1);
    }

    #[tokio::test]
    async fn deactivated_credentials_are_skipped() {
        let pool = InMemoryCredentialPool::new();
        let c = credential("only", 5);
        pool.register(c.clone()).await.unwrap();

        let paused = CredentialChanges {
            is_active: Some(false),
            ..CredentialChanges::default()
        };
        let updated = pool.update(c.id, paused).await.unwrap();
        assert!(!updated.is_active);
        assert!(matches!(pool.acquire().await.unwrap(), Acquisition::Unavailable));

        let resumed = CredentialChanges {
            is_active: Some(true),
            daily_limit: Some(1),
            ..CredentialChanges::default()
        };
        pool.update(c.id, resumed).await.unwrap();
        reserved(pool.acquire().await.unwrap());
        assert!(matches!(pool.acquire().await.unwrap(), Acquisition::Unavailable));
    }

    #[tokio::test]
    async fn invalid_edits_leave_the_credential_unchanged() {
        let pool = InMemoryCredentialPool::new();
        let c = credential("only", 5);
        pool.register(c.clone()).await.unwrap();

        let too_big = CredentialChanges {
            daily_limit: Some(5000),
            ..CredentialChanges::default()
        };
        assert!(matches!(pool.update(c.id, too_big).await, Err(PoolError::Invalid(_))));
        assert_eq!(pool.get(c.id).await.unwrap().unwrap(), c);

        let missing = CredentialId::new();
        assert_eq!(
            pool.update(missing, CredentialChanges::default()).await.unwrap_err(),
            PoolError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn removing_a_credential_drops_its_refunds() {
        let pool = InMemoryCredentialPool::new();
        let c = credential("only", 5);
        pool.register(c.clone()).await.unwrap();

        let r = reserved(pool.acquire().await.unwrap());
        pool.remove(c.id).await.unwrap();
        pool.release(&r, false).await.unwrap();

        assert!(pool.get(c.id).await.unwrap().is_none());
        assert!(pool.list().await.unwrap().is_empty());
        assert_eq!(pool.remove(c.id).await.unwrap_err(), PoolError::NotFound(c.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_overcommit() {
        let pool = Arc::new(InMemoryCredentialPool::new());
        let c = credential("shared", 10);
        pool.register(c.clone()).await.unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.unwrap() })
            })
            .collect();

        let mut granted = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), Acquisition::Reserved(_)) {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(pool.get(c.id).await.unwrap().unwrap().daily_sent, 10);
    }
}
