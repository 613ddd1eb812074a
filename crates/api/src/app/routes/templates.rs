use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use outreach_campaigns::{Template, TemplateChanges};
use outreach_core::TemplateId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_template).get(list_templates))
        .route(
            "/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
}

pub async fn list_templates(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.stores.templates.list_templates().await {
        Ok(items) => {
            let items = items.iter().map(dto::template_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::repository_error_to_response(e),
    }
}

pub async fn create_template(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateTemplateRequest>,
) -> axum::response::Response {
    let template = match Template::new(body.name, body.subject, body.body, body.variables, Utc::now()) {
        Ok(t) => t,
        Err(e) => return errors::domain_error_to_response(e),
    };

    if let Err(e) = services.stores.templates.insert_template(&template).await {
        return errors::repository_error_to_response(e);
    }

    tracing::info!(template_id = %template.id, name = %template.name, "template created");
    (StatusCode::CREATED, Json(dto::template_to_json(&template))).into_response()
}

pub async fn get_template(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TemplateId = match errors::parse_id(&id, "template") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.templates.get_template(id).await {
        Ok(Some(t)) => (StatusCode::OK, Json(dto::template_to_json(&t))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("template not found: {id}")),
        Err(e) => errors::repository_error_to_response(e),
    }
}

/// Partial edit. Jobs of campaigns using an inactive template wait until it
/// is reactivated.
pub async fn update_template(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<TemplateChanges>,
) -> axum::response::Response {
    let id: TemplateId = match errors::parse_id(&id, "template") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let mut template = match services.stores.templates.get_template(id).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("template not found: {id}"));
        }
        Err(e) => return errors::repository_error_to_response(e),
    };
    if let Err(e) = template.update(body) {
        return errors::domain_error_to_response(e);
    }
    if let Err(e) = services.stores.templates.update_template(&template).await {
        return errors::repository_error_to_response(e);
    }

    tracing::info!(template_id = %template.id, is_active = template.is_active, "template updated");
    (StatusCode::OK, Json(dto::template_to_json(&template))).into_response()
}

/// Refused with 409 while any campaign references the template.
pub async fn delete_template(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TemplateId = match errors::parse_id(&id, "template") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.stores.templates.delete_template(id).await {
        Ok(()) => {
            tracing::info!(template_id = %id, "template deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => errors::repository_error_to_response(e),
    }
}
