//! Sending credentials and their shared daily quota.

pub mod pool;
pub mod postgres;

pub use pool::{
    select_credential, Acquisition, CredentialPool, InMemoryCredentialPool, PoolError,
    Reservation,
};
pub use postgres::PostgresCredentialPool;
