use axum::{routing::get, Router};

pub mod campaigns;
pub mod credentials;
pub mod system;
pub mod templates;
pub mod tracking;

/// Router for all operator endpoints (behind the bearer-token check).
pub fn router() -> Router {
    Router::new()
        .route("/dispatcher/stats", get(system::dispatcher_stats))
        .nest("/templates", templates::router())
        .nest("/campaigns", campaigns::router())
        .nest("/credentials", credentials::router())
        .nest("/tracking", tracking::router())
}
