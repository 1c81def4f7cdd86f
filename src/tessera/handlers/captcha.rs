use crate::session::{config::CaptchaStyle, RequestContext, SessionManager};
use axum::{
    extract::{Extension, Query},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CaptchaQuery {
    login_id: String,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CaptchaImageQuery {
    id: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CaptchaIssued {
    /// `null` when no challenge is required, the hourly cap is reached, or
    /// the style is reCAPTCHA.
    pub captcha_id: Option<String>,
    /// `classic` or `google_recaptcha_v3`.
    pub style: String,
    /// Site key the client loads reCAPTCHA with.
    pub site_key: Option<String>,
}

#[utoipa::path(
    get,
    path = "/v1/session/captcha",
    params(CaptchaQuery),
    responses(
        (status = 200, description = "Challenge id or reCAPTCHA site key", body = CaptchaIssued)
    ),
    tag = "session"
)]
pub async fn captcha(
    manager: Extension<Arc<SessionManager>>,
    context: RequestContext,
    Query(query): Query<CaptchaQuery>,
) -> impl IntoResponse {
    let style = manager.config().captcha_style(&context);
    let issued = match style {
        CaptchaStyle::Recaptcha => CaptchaIssued {
            captcha_id: None,
            style: style.as_str().to_string(),
            site_key: manager.config().recaptcha_site_key().map(str::to_string),
        },
        CaptchaStyle::Classic => CaptchaIssued {
            captcha_id: manager.generate_challenge(&query.login_id).await,
            style: style.as_str().to_string(),
            site_key: None,
        },
    };
    Json(issued)
}

#[utoipa::path(
    get,
    path = "/v1/session/captcha/image",
    params(CaptchaImageQuery),
    responses(
        (status = 200, description = "Challenge image", content_type = "image/png"),
        (status = 400, description = "Unknown, expired or already rendered challenge"),
    ),
    tag = "session"
)]
pub async fn captcha_image(
    manager: Extension<Arc<SessionManager>>,
    Query(query): Query<CaptchaImageQuery>,
) -> impl IntoResponse {
    match manager.render_challenge(&query.id).await {
        Some(png) => ([(CONTENT_TYPE, "image/png")], png).into_response(),
        None => (StatusCode::BAD_REQUEST, "invalid captcha").into_response(),
    }
}
