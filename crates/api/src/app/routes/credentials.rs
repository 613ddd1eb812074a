use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use outreach_campaigns::{Credential, CredentialChanges, NewCredential};
use outreach_core::CredentialId;
use outreach_infra::credentials::PoolError;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_credential).get(list_credentials))
        .route("/reset-daily", post(reset_daily))
        .route(
            "/:id",
            get(get_credential).put(update_credential).delete(delete_credential),
        )
}

fn credential_id(raw: &str) -> Result<CredentialId, axum::response::Response> {
    errors::parse_id(raw, "credential")
}

pub async fn register_credential(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewCredential>,
) -> axum::response::Response {
    let now = Utc::now();
    let credential = match Credential::new(body, services.config.default_daily_limit, now.date_naive(), now) {
        Ok(c) => c,
        Err(e) => return errors::domain_error_to_response(e),
    };

    if let Err(e) = services.stores.credentials.register(credential.clone()).await {
        return errors::pool_error_to_response(e);
    }

    tracing::info!(
        credential_id = %credential.id,
        host = %credential.host,
        daily_limit = credential.daily_limit,
        "credential registered"
    );
    (StatusCode::CREATED, Json(dto::credential_to_json(&credential))).into_response()
}

pub async fn list_credentials(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.stores.credentials.list().await {
        Ok(items) => {
            let items = items.iter().map(dto::credential_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::pool_error_to_response(e),
    }
}

pub async fn get_credential(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match credential_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.credentials.get(id).await {
        Ok(Some(c)) => (StatusCode::OK, Json(dto::credential_to_json(&c))).into_response(),
        Ok(None) => errors::pool_error_to_response(PoolError::NotFound(id)),
        Err(e) => errors::pool_error_to_response(e),
    }
}

/// Partial edit. `is_active: false` takes the credential out of rotation
/// without losing its quota state.
pub async fn update_credential(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<CredentialChanges>,
) -> axum::response::Response {
    let id = match credential_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.credentials.update(id, body).await {
        Ok(credential) => {
            tracing::info!(
                credential_id = %credential.id,
                is_active = credential.is_active,
                daily_limit = credential.daily_limit,
                "credential updated"
            );
            (StatusCode::OK, Json(dto::credential_to_json(&credential))).into_response()
        }
        Err(e) => errors::pool_error_to_response(e),
    }
}

pub async fn delete_credential(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match credential_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.credentials.remove(id).await {
        Ok(()) => {
            tracing::info!(credential_id = %id, "credential deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => errors::pool_error_to_response(e),
    }
}

/// Manual quota reset. Only credentials whose quota day is older than the
/// target date are touched, so repeating the call is harmless.
pub async fn reset_daily(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::ResetDailyRequest>>,
) -> axum::response::Response {
    let date = body
        .and_then(|Json(b)| b.date)
        .unwrap_or_else(|| Utc::now().date_naive());

    match services.maintenance.reset_once(date).await {
        Ok(reset) => (
            StatusCode::OK,
            Json(serde_json::json!({ "date": date, "reset": reset })),
        )
            .into_response(),
        Err(e) => errors::pool_error_to_response(e),
    }
}
