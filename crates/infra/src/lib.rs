//! Infrastructure layer: storage, the send queue, the credential pool,
//! tracking, the dispatcher worker pool and campaign orchestration.
//!
//! Every store is a trait with an in-memory implementation (tests/dev) and a
//! Postgres implementation.

pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod maintenance;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod tracking;

mod integration_tests;
