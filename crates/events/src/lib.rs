//! Append-only event primitives: the `Event` trait, stream envelopes and
//! projections that fold envelopes into read models.

pub mod envelope;
pub mod event;
pub mod projection;
pub mod runner;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
