//! Projection runner: replays envelopes through a projection while enforcing
//! stream consistency and monotonic sequencing.

use thiserror::Error;

use outreach_core::CampaignId;

use crate::{EventEnvelope, Projection};

/// Progress of a projection over a single stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    stream_id: CampaignId,
    last_sequence_number: u64,
}

impl ProjectionCursor {
    pub fn stream_id(&self) -> CampaignId {
        self.stream_id
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("stream mismatch: expected {expected}, found {found}")]
    StreamMismatch {
        expected: CampaignId,
        found: CampaignId,
    },
    #[error("non-monotonic sequence: last {last}, found {found}")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Runs envelopes through a projection and tracks the cursor.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursor: Option<ProjectionCursor>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursor: None,
        }
    }

    /// Create a runner pinned to one stream, so a stray envelope from another
    /// campaign is rejected instead of silently folded in.
    pub fn new_for_stream(stream_id: CampaignId, projection: P) -> Self {
        Self {
            projection,
            cursor: Some(ProjectionCursor {
                stream_id,
                last_sequence_number: 0,
            }),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    pub fn cursor(&self) -> Option<ProjectionCursor> {
        self.cursor
    }

    /// Apply one envelope.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError> {
        let found_stream = envelope.stream_id();
        let found_seq = envelope.sequence_number();

        if let Some(c) = self.cursor {
            if c.stream_id != found_stream {
                return Err(ProjectionError::StreamMismatch {
                    expected: c.stream_id,
                    found: found_stream,
                });
            }
            if found_seq <= c.last_sequence_number {
                return Err(ProjectionError::NonMonotonicSequence {
                    last: c.last_sequence_number,
                    found: found_seq,
                });
            }
        }

        self.projection.apply(envelope);
        self.cursor = Some(ProjectionCursor {
            stream_id: found_stream,
            last_sequence_number: found_seq,
        });
        Ok(())
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a projection for one stream by replaying its full history.
    pub fn rebuild<'a>(
        stream_id: CampaignId,
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(P, ProjectionCursor), ProjectionError>
    where
        P::Ev: 'a,
    {
        let mut runner = ProjectionRunner::new_for_stream(stream_id, factory());
        runner.run(envelopes)?;
        let cursor = runner.cursor.unwrap_or(ProjectionCursor {
            stream_id,
            last_sequence_number: 0,
        });
        Ok((runner.projection, cursor))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use outreach_core::EventId;

    use super::*;
    use crate::Event;

    #[derive(Debug, Clone)]
    struct Ping(DateTime<Utc>);

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "test.ping"
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Debug, Default)]
    struct Count(u64);

    impl Projection for Count {
        type Ev = Ping;

        fn apply(&mut self, _envelope: &EventEnvelope<Ping>) {
            self.0 += 1;
        }
    }

    fn env(stream: CampaignId, seq: u64) -> EventEnvelope<Ping> {
        EventEnvelope::new(EventId::new(), stream, seq, Utc::now(), Ping(Utc::now()))
    }

    #[test]
    fn rejects_replayed_positions() {
        let stream = CampaignId::new();
        let mut runner = ProjectionRunner::new_for_stream(stream, Count::default());

        runner.apply(&env(stream, 1)).unwrap();
        runner.apply(&env(stream, 5)).unwrap();
        let err = runner.apply(&env(stream, 5)).unwrap_err();

        assert_eq!(err, ProjectionError::NonMonotonicSequence { last: 5, found: 5 });
        assert_eq!(runner.projection().0, 2);
    }

    #[test]
    fn rejects_other_streams() {
        let stream = CampaignId::new();
        let other = CampaignId::new();
        let mut runner = ProjectionRunner::new_for_stream(stream, Count::default());

        assert!(matches!(
            runner.apply(&env(other, 1)),
            Err(ProjectionError::StreamMismatch { .. })
        ));
    }

    #[test]
    fn rebuild_of_empty_stream_starts_at_zero() {
        let stream = CampaignId::new();
        let (count, cursor) =
            ProjectionRunner::rebuild(stream, Count::default, std::iter::empty()).unwrap();
        assert_eq!(count.0, 0);
        assert_eq!(cursor.last_sequence_number(), 0);
    }
}
