//! `outreach-core`: domain foundation shared by every outreach crate.
//!
//! Pure building blocks only: identifiers, the domain error model, aggregate
//! traits and explicit state machines. No IO lives here.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod state;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, CredentialId, EventId, JobId, LeadId, RecipientId, TemplateId};
pub use state::StateMachine;
