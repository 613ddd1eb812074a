//! Sending credentials and their daily quota.

use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{CredentialId, DomainError, DomainResult};

pub const DEFAULT_DAILY_LIMIT: u32 = 200;
pub const MAX_DAILY_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    None,
    Ssl,
    #[default]
    Tls,
}

impl Encryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encryption::None => "none",
            Encryption::Ssl => "ssl",
            Encryption::Tls => "tls",
        }
    }
}

impl FromStr for Encryption {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Encryption::None),
            "ssl" => Ok(Encryption::Ssl),
            "tls" | "starttls" => Ok(Encryption::Tls),
            other => Err(DomainError::validation(format!("unknown encryption: {other}"))),
        }
    }
}

/// Registration input for a credential.
#[derive(Clone, Deserialize)]
pub struct NewCredential {
    pub name: String,
    pub provider: String,
    pub host: String,
    pub port: u32,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub encryption: Encryption,
    pub daily_limit: Option<u32>,
}

/// Partial edit of a credential. Quota state (`daily_sent`,
/// `last_reset_date`) is owned by the pool and cannot be edited.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialChanges {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub host: Option<String>,
    pub port: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub encryption: Option<Encryption>,
    pub daily_limit: Option<u32>,
    pub is_active: Option<bool>,
}

/// A mail-sending account with a daily quota.
///
/// `daily_sent` counts reserved plus committed sends for the quota day in
/// `last_reset_date`. It never exceeds `daily_limit`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub name: String,
    pub provider: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub encryption: Encryption,
    pub daily_limit: u32,
    pub daily_sent: u32,
    pub last_reset_date: NaiveDate,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("daily_limit", &self.daily_limit)
            .field("daily_sent", &self.daily_sent)
            .field("last_reset_date", &self.last_reset_date)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl Credential {
    /// Validate registration input. `default_limit` applies when none is given.
    pub fn new(
        input: NewCredential,
        default_limit: u32,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if input.name.trim().is_empty() {
            return Err(DomainError::validation("credential name must not be empty"));
        }
        if input.host.trim().is_empty() {
            return Err(DomainError::validation("credential host must not be empty"));
        }
        let port = u16::try_from(input.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| DomainError::validation("port must be between 1 and 65535"))?;

        let daily_limit = input.daily_limit.unwrap_or(default_limit);
        if !(1..=MAX_DAILY_LIMIT).contains(&daily_limit) {
            return Err(DomainError::validation(format!(
                "daily_limit must be between 1 and {MAX_DAILY_LIMIT}"
            )));
        }

        Ok(Self {
            id: CredentialId::new(),
            name: input.name.trim().to_string(),
            provider: input.provider,
            host: input.host.trim().to_string(),
            port,
            username: input.username,
            password: input.password,
            encryption: input.encryption,
            daily_limit,
            daily_sent: 0,
            last_reset_date: today,
            is_active: true,
            created_at: now,
        })
    }

    pub fn remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily_sent)
    }

    pub fn is_eligible(&self) -> bool {
        self.is_active && self.daily_sent < self.daily_limit
    }

    /// Take one unit of quota. Returns the quota day the unit belongs to.
    pub fn reserve(&mut self) -> DomainResult<NaiveDate> {
        if !self.is_eligible() {
            return Err(DomainError::invariant(format!(
                "credential {} has no remaining quota",
                self.id
            )));
        }
        self.daily_sent += 1;
        Ok(self.last_reset_date)
    }

    /// Give back a unit reserved on `reserved_on`.
    ///
    /// Ignored (returns `false`) when the credential was reset since the
    /// reservation, so a late refund cannot open quota on the new day.
    pub fn refund(&mut self, reserved_on: NaiveDate) -> bool {
        if self.last_reset_date != reserved_on || self.daily_sent == 0 {
            return false;
        }
        self.daily_sent -= 1;
        true
    }

    pub fn needs_reset(&self, today: NaiveDate) -> bool {
        self.last_reset_date < today
    }

    pub fn reset(&mut self, today: NaiveDate) {
        self.daily_sent = 0;
        self.last_reset_date = today;
    }

    /// Apply an operator edit with the registration rules. Lowering the
    /// limit below today's usage leaves the credential exhausted for the day.
    pub fn update(&mut self, changes: CredentialChanges) -> DomainResult<()> {
        let input = NewCredential {
            name: changes.name.unwrap_or_else(|| self.name.clone()),
            provider: changes.provider.unwrap_or_else(|| self.provider.clone()),
            host: changes.host.unwrap_or_else(|| self.host.clone()),
            port: changes.port.unwrap_or(u32::from(self.port)),
            username: changes.username.unwrap_or_else(|| self.username.clone()),
            password: changes.password.unwrap_or_else(|| self.password.clone()),
            encryption: changes.encryption.unwrap_or(self.encryption),
            daily_limit: Some(changes.daily_limit.unwrap_or(self.daily_limit)),
        };
        let checked = Credential::new(input, self.daily_limit, self.last_reset_date, self.created_at)?;

        self.name = checked.name;
        self.provider = checked.provider;
        self.host = checked.host;
        self.port = checked.port;
        self.username = checked.username;
        self.password = checked.password;
        self.encryption = checked.encryption;
        self.daily_limit = checked.daily_limit;
        self.daily_sent = self.daily_sent.min(self.daily_limit);
        if let Some(active) = changes.is_active {
            self.is_active = active;
        }
        Ok(())
    }
}
