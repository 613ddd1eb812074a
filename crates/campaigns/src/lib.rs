//! Campaign delivery domain (pure, deterministic).
//!
//! Business rules for campaigns, recipients, leads, templates, sending
//! credentials and tracking events. No IO, no HTTP, no storage.

pub mod campaign;
pub mod credential;
pub mod lead;
pub mod recipient;
pub mod template;
pub mod tracking;

pub use campaign::{
    Campaign, CampaignCommand, CampaignCounters, CampaignEvent, CampaignSnapshot, CampaignStatus,
    CancelCampaign, CompleteCampaign, CreateCampaign, ScheduleCampaign, StartCampaign,
};
pub use credential::{
    Credential, CredentialChanges, Encryption, NewCredential, DEFAULT_DAILY_LIMIT, MAX_DAILY_LIMIT,
};
pub use lead::{Lead, LeadEmail, LeadFilter};
pub use recipient::{FlagChange, Recipient, RecipientStatus, TrackingId};
pub use template::{
    escape_html, render_placeholders, RecipientVariables, RenderedMessage, Template, TemplateChanges,
};
pub use tracking::{TrackingEvent, TrackingEventType};
