use super::status_for;
use crate::session::{RequestContext, SessionManager, SessionOutcome};
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

#[derive(ToSchema, Deserialize)]
pub struct SocialBody {
    token: String,
    /// Provider name, `GOOGLE` or `FACEBOOK` unless configured otherwise.
    origin: String,
}

#[utoipa::path(
    post,
    path = "/v1/session/social",
    request_body = SocialBody,
    responses(
        (status = 200, description = "Session started", body = SessionOutcome),
        (status = 401, description = "Social token rejected", body = SessionOutcome),
        (status = 403, description = "Account exists and is active", body = SessionOutcome),
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn social(
    manager: Extension<Arc<SessionManager>>,
    context: RequestContext,
    payload: Option<Json<SocialBody>>,
) -> impl IntoResponse {
    let Some(Json(body)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let outcome = manager
        .start_federated_session(&body.token, &body.origin, &context)
        .await;
    (status_for(&outcome.error), Json(outcome)).into_response()
}
