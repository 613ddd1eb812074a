//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and engine wiring (stores, dispatcher, maintenance)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router.
///
/// `/health` and the open-tracking pixel are public; everything else
/// requires `operator_token` when one is configured.
pub fn build_app(services: Arc<AppServices>, operator_token: Option<String>) -> Router {
    let auth_state = middleware::AuthState::new(operator_token);

    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/track/:tracking_id", get(routes::tracking::open_pixel))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
