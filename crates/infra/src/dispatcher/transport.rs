//! Mail transport seam.

use async_trait::async_trait;
use tracing::info;

use outreach_campaigns::{Credential, RenderedMessage};

/// Why a send attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Worth retrying (timeouts, 4xx SMTP replies, connection resets).
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Retrying cannot help (rejected address, 5xx SMTP replies).
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SendError::Transient(m) | SendError::Permanent(m) => m,
        }
    }
}

/// Delivers one rendered message through one credential.
///
/// Implementations must be safe to call again for the same message: delivery
/// is at-least-once.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        credential: &Credential,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<(), SendError>;
}

/// Logs every message and reports success. Used by the dev server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(
        &self,
        credential: &Credential,
        to: &str,
        message: &RenderedMessage,
    ) -> Result<(), SendError> {
        info!(
            credential_id = %credential.id,
            host = %credential.host,
            to,
            subject = %message.subject,
            body_len = message.html_body.len(),
            "message delivered to log transport"
        );
        Ok(())
    }
}
