use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn dispatcher_stats(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.dispatcher_stats().snapshot())
}
