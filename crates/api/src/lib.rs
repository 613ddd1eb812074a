//! HTTP API: operator routes, tracking endpoints and server wiring.

pub mod app;
pub mod middleware;
