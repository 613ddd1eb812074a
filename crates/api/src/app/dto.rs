use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use outreach_campaigns::{Credential, FlagChange, Template, TrackingEventType};
use outreach_infra::tracking::Recorded;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Delivery event reported by a mail provider or click redirector.
#[derive(Debug, Deserialize)]
pub struct TrackingWebhookRequest {
    pub tracking_id: String,
    pub event_type: TrackingEventType,
    #[serde(default)]
    pub metadata: JsonValue,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetDailyRequest {
    /// Quota day to reset to; today (UTC) when omitted.
    pub date: Option<chrono::NaiveDate>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn template_to_json(t: &Template) -> JsonValue {
    json!({
        "id": t.id.to_string(),
        "name": t.name,
        "subject": t.subject,
        "body": t.body,
        "variables": t.variables,
        "is_active": t.is_active,
        "created_at": t.created_at,
    })
}

/// Credential without its password.
pub fn credential_to_json(c: &Credential) -> JsonValue {
    json!({
        "id": c.id.to_string(),
        "name": c.name,
        "provider": c.provider,
        "host": c.host,
        "port": c.port,
        "username": c.username,
        "encryption": c.encryption,
        "daily_limit": c.daily_limit,
        "daily_sent": c.daily_sent,
        "remaining": c.remaining(),
        "last_reset_date": c.last_reset_date,
        "is_active": c.is_active,
        "created_at": c.created_at,
    })
}

pub fn recorded_to_json(r: &Recorded) -> JsonValue {
    let change = match r.change {
        FlagChange::Set => "set",
        FlagChange::AlreadySet => "already_set",
        FlagChange::Rejected => "rejected",
    };
    json!({
        "event_id": r.envelope.event_id().to_string(),
        "sequence_number": r.envelope.sequence_number(),
        "recipient_id": r.envelope.payload().recipient_id.to_string(),
        "event_type": r.envelope.payload().event_type,
        "change": change,
    })
}
