use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use outreach_core::CampaignId;
use outreach_infra::orchestrator::NewCampaign;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_campaign).get(list_campaigns))
        .route("/:id", get(get_campaign))
        .route("/:id/launch", post(launch_campaign))
        .route("/:id/cancel", post(cancel_campaign))
        .route("/:id/queue", get(queue_stats))
        .route("/:id/reconcile", get(reconcile))
}

fn campaign_id(raw: &str) -> Result<CampaignId, axum::response::Response> {
    errors::parse_id(raw, "campaign")
}

pub async fn create_campaign(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewCampaign>,
) -> axum::response::Response {
    match services.orchestrator.create_campaign(body, Utc::now()).await {
        Ok(c) => (StatusCode::CREATED, Json(c)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Every campaign with its counters and open/click rates, newest first.
pub async fn list_campaigns(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.list().await {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Campaign with counters, queue stats and its recipients.
pub async fn get_campaign(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.overview(id).await {
        Ok(overview) => (StatusCode::OK, Json(overview)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn launch_campaign(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.launch(id, Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn cancel_campaign(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.cancel(id, Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.campaigns.get_campaign(id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("campaign not found: {id}"));
        }
        Err(e) => return errors::repository_error_to_response(e),
    }

    match services.stores.queue.campaign_stats(id).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn reconcile(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match campaign_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.recorder.reconcile(id).await {
        Ok(report) => {
            if !report.consistent {
                tracing::warn!(campaign_id = %id, "stored counters drifted from the tracking log");
            }
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => errors::tracking_error_to_response(e),
    }
}
