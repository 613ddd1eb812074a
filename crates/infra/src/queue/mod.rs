//! Send queue: one job per (campaign, recipient), leased by dispatcher workers.
//!
//! - `QueueJob`: job state plus the pure transition methods
//! - `QueueStore`: linearizable lease / complete / reap / cancel operations
//! - `InMemoryQueueStore` and `PostgresQueueStore` implementations

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresQueueStore;
pub use store::{InMemoryQueueStore, QueueError, QueueStats, QueueStore};
pub use types::{
    Completion, DeadReason, JobOutcome, JobStatus, LeaseId, QueueJob, RetryPolicy,
};
