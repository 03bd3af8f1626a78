//! Read endpoints served directly from the user store.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::error;

use twinder_core::{UserMatches, UserStats};
use twinder_store::{with_deadline, StoreError};

use super::{api_error, ApiError, ErrorResponse};
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/stats/{userId}",
    tag = "Users",
    params(("userId" = String, Path, description = "Numeric user id")),
    responses(
        (status = 200, description = "Like and dislike counts", body = UserStats),
        (status = 400, description = "User id is not an integer", body = ErrorResponse),
        (status = 404, description = "User has never swiped", body = ErrorResponse),
        (status = 500, description = "Store error", body = ErrorResponse)
    )
)]
pub async fn user_stats(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<UserStats>, ApiError> {
    let user_id = parse_user_id(&raw)?;
    let found = with_deadline(state.store_timeout, state.store.get_user_stats(user_id))
        .await
        .map_err(|e| store_failure(user_id, e))?;
    found.map(Json).ok_or_else(|| not_found(&raw))
}

#[utoipa::path(
    get,
    path = "/matches/{userId}",
    tag = "Users",
    params(("userId" = String, Path, description = "Numeric user id")),
    responses(
        (status = 200, description = "Ids the user liked, ascending", body = UserMatches),
        (status = 400, description = "User id is not an integer", body = ErrorResponse),
        (status = 404, description = "User has never swiped", body = ErrorResponse),
        (status = 500, description = "Store error", body = ErrorResponse)
    )
)]
pub async fn user_matches(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<UserMatches>, ApiError> {
    let user_id = parse_user_id(&raw)?;
    let found = with_deadline(state.store_timeout, state.store.get_matches(user_id))
        .await
        .map_err(|e| store_failure(user_id, e))?;
    found.map(Json).ok_or_else(|| not_found(&raw))
}

fn parse_user_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("invalid userId: {raw}")))
}

fn not_found(raw: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("userId not found: {raw}"))
}

fn store_failure(user_id: i64, e: StoreError) -> ApiError {
    error!(user_id, error = %e, "Store read failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
