//! Swipe ingestion: validate, publish, count.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tracing::{debug, error};

use twinder_core::{SwipeRequest, ValidationError};

use super::{api_error, ApiError, ErrorResponse};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/swipe/{direction}",
    tag = "Swipes",
    params(("direction" = String, Path, description = "`right` (like) or `left` (dislike)")),
    request_body = SwipeRequest,
    responses(
        (status = 201, description = "Swipe accepted and published"),
        (status = 400, description = "Malformed or invalid request", body = ErrorResponse),
        (status = 500, description = "Broker publish failed", body = ErrorResponse)
    )
)]
pub async fn swipe(
    State(state): State<Arc<AppState>>,
    Path(direction): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request: SwipeRequest = serde_json::from_slice(&body)
        .map_err(|_| bad_request(ValidationError::Malformed))?;
    let event = request.validate(&direction).map_err(bad_request)?;

    let payload = event.encode().map_err(|e| {
        error!(error = %e, "Failed to encode swipe");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    if let Err(e) = state.publisher.publish(payload).await {
        error!(
            broker = state.publisher.backend_name(),
            swiper = event.swiper_id,
            error = %e,
            "Swipe publish failed"
        );
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    state.throughput.increment();
    debug!(swiper = event.swiper_id, swipee = event.swipee_id, direction = %event.direction, "Swipe published");
    Ok(StatusCode::CREATED)
}

fn bad_request(e: ValidationError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, e.to_string())
}
