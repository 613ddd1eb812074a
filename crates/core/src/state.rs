//! Explicit finite state machines.
//!
//! Entity statuses are persisted as strings, but every change goes through a
//! transition table. Anything not listed in the table is rejected.

use crate::error::{DomainError, DomainResult};

/// A status enum with an enumerated transition table.
pub trait StateMachine: Copy + Eq + core::fmt::Debug {
    /// Entity name used in error messages.
    const ENTITY: &'static str;

    /// Whether `self -> next` is listed in the transition table.
    fn can_transition_to(self, next: Self) -> bool;

    /// Terminal states have no outgoing transitions.
    fn is_terminal(self) -> bool;

    /// Validate a transition, returning the new state.
    fn transition(self, next: Self) -> DomainResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::transition(Self::ENTITY, self, next))
        }
    }
}
