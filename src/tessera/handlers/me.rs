use super::status_for;
use crate::session::{groups::GROUP_ALL, AccessOutcome, RequestContext, SessionManager};
use axum::{
    extract::Extension,
    response::{IntoResponse, Json},
};
use std::sync::Arc;
use tracing::instrument;

#[utoipa::path(
    get,
    path = "/v1/session/me",
    responses(
        (status = 200, description = "Current user", body = AccessOutcome),
        (status = 401, description = "Missing, invalid or expired token", body = AccessOutcome),
        (status = 403, description = "Inactive user", body = AccessOutcome),
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn me(manager: Extension<Arc<SessionManager>>, context: RequestContext) -> impl IntoResponse {
    let outcome = manager.validate_access(&context, Some(GROUP_ALL)).await;
    (status_for(&outcome.error), Json(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/session/logout",
    responses(
        (status = 200, description = "Token revoked", body = AccessOutcome),
        (status = 401, description = "Missing, invalid or expired token", body = AccessOutcome),
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn logout(
    manager: Extension<Arc<SessionManager>>,
    context: RequestContext,
) -> impl IntoResponse {
    let outcome = manager.end_session(&context).await;
    (status_for(&outcome.error), Json(outcome))
}
