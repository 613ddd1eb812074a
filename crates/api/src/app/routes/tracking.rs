use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::Value as JsonValue;

use outreach_campaigns::TrackingEventType;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// 1x1 transparent GIF.
static PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn router() -> Router {
    Router::new().route("/events", post(ingest_event))
}

/// Provider webhook: one delivery event for the recipient owning `tracking_id`.
/// `sent` is reserved for the dispatcher.
pub async fn ingest_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TrackingWebhookRequest>,
) -> axum::response::Response {
    if body.event_type == TrackingEventType::Sent {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "event_type_not_accepted",
            "sent events are recorded by the dispatcher only",
        );
    }

    let occurred_at = body.occurred_at.unwrap_or_else(Utc::now);
    match services
        .recorder
        .record_by_tracking_id(
            &body.tracking_id,
            body.event_type,
            body.metadata,
            body.ip_address,
            body.user_agent,
            occurred_at,
        )
        .await
    {
        Ok(recorded) => (StatusCode::CREATED, Json(dto::recorded_to_json(&recorded))).into_response(),
        Err(e) => errors::tracking_error_to_response(e),
    }
}

/// Open pixel. Always answers with the image; unknown ids are only logged.
pub async fn open_pixel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tracking_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip_address = client_ip(&headers);
    let user_agent = header_str(&headers, header::USER_AGENT.as_str());

    if let Err(err) = services
        .recorder
        .record_by_tracking_id(
            &tracking_id,
            TrackingEventType::Opened,
            JsonValue::Null,
            ip_address,
            user_agent,
            Utc::now(),
        )
        .await
    {
        tracing::debug!(%tracking_id, error = %err, "open not recorded");
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        &PIXEL_GIF[..],
    )
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}
