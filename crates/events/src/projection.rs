use crate::{Event, EventEnvelope};

/// A projection folds an append-only event stream into a read model.
///
/// Campaign counters are a projection of the tracking log: they can be thrown
/// away and rebuilt by replaying the stream, which is how stored counters are
/// reconciled against the log.
///
/// ## Idempotency
///
/// Webhooks are redelivered and logs are replayed, so `apply` must tolerate
/// seeing the same fact twice. The usual strategies:
///
/// - **Set semantics**: record distinct keys (e.g. recipient per event type)
///   rather than incrementing blindly
/// - **Sequence checks**: skip envelopes at or below the last applied position
///   (see [`crate::ProjectionRunner`])
///
/// `apply` does not return errors. Irrelevant events are ignored.
pub trait Projection {
    type Ev: Event;

    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
