//! HTTP boundary for the session core.

use crate::session::SessionManager;
use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use utoipa::OpenApi;

pub mod handlers;

use self::handlers::{captcha, health, login, me, social};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        login::login,
        social::social,
        captcha::captcha,
        captcha::captcha_image,
        me::me,
        me::logout,
    ),
    components(schemas(
        health::Health,
        login::LoginBody,
        social::SocialBody,
        captcha::CaptchaIssued,
        crate::session::SessionOutcome,
        crate::session::AccessOutcome,
        crate::session::ErrorMessage,
        crate::session::User,
    )),
    tags(
        (name = "session", description = "Login, logout and captcha challenges"),
        (name = "health", description = "Service status"),
    )
)]
pub struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

async fn openapi_json() -> impl IntoResponse {
    Json(openapi())
}

/// Build the router with every route and the request layers.
pub fn router(manager: Arc<SessionManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/openapi.json", get(openapi_json))
        .route("/v1/session/login", post(login::login))
        .route("/v1/session/social", post(social::social))
        .route("/v1/session/logout", post(me::logout))
        .route("/v1/session/captcha", get(captcha::captcha))
        .route("/v1/session/captcha/image", get(captcha::captcha_image))
        .route("/v1/session/me", get(me::me))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(manager))
                .layer(middleware::from_fn(handlers::middleware::resolve_auth_info)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, manager: Arc<SessionManager>) -> Result<()> {
    let app = router(manager);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", err);
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
