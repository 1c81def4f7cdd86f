use super::status_for;
use crate::session::{
    captcha::ChallengeAnswer, LoginRequest, RequestContext, SessionManager, SessionOutcome,
};
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

#[derive(ToSchema, Deserialize)]
pub struct LoginBody {
    login_id: String,
    password: String,
    #[serde(default)]
    permanent: bool,
    captcha_id: Option<String>,
    captcha_value: Option<String>,
    recaptcha_token: Option<String>,
}

impl From<LoginBody> for LoginRequest {
    fn from(body: LoginBody) -> Self {
        Self::new(&body.login_id, SecretString::from(body.password))
            .with_permanent(body.permanent)
            .with_captcha(ChallengeAnswer {
                captcha_id: body.captcha_id,
                captcha_value: body.captcha_value,
                recaptcha_token: body.recaptcha_token,
            })
    }
}

#[utoipa::path(
    post,
    path = "/v1/session/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session started", body = SessionOutcome),
        (status = 401, description = "Invalid credentials or captcha", body = SessionOutcome),
        (status = 500, description = "Internal error", body = SessionOutcome),
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn login(
    manager: Extension<Arc<SessionManager>>,
    context: RequestContext,
    payload: Option<Json<LoginBody>>,
) -> impl IntoResponse {
    let Some(Json(body)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload").into_response();
    };

    let outcome = manager.start_session(&body.into(), &context).await;
    (status_for(&outcome.error), Json(outcome)).into_response()
}
