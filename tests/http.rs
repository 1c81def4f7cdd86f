#![allow(clippy::unwrap_used)]

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tessera::{
    session::{
        config::CaptchaStyle, providers::hash_secret, store::MemoryStore, Configurable,
        SessionConfig, SessionManager, User,
    },
    tessera::router,
};
use tower::ServiceExt;

async fn app(config: SessionConfig) -> Result<(Router, Arc<MemoryStore>)> {
    let store = Arc::new(MemoryStore::new());
    store
        .put_user(User {
            id: 7,
            login_id: "ana@example.com".to_string(),
            password_hash: Some(hash_secret("correct horse")?),
            role: "support".to_string(),
            active: true,
            name: "Ana".to_string(),
            ..User::default()
        })
        .await;
    let manager = SessionManager::builder(config, store.clone()).build()?;
    Ok((router(Arc::new(manager)), store))
}

fn config() -> SessionConfig {
    SessionConfig::new(SecretString::from("http-test-key")).with_group("support_team", &["support"])
}

fn login_request(password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/session/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"login_id": "ana@example.com", "password": password}).to_string(),
        ))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn health_reports_name_and_request_id() -> Result<()> {
    let (app, _) = app(config()).await?;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test]
async fn openapi_lists_session_paths() -> Result<()> {
    let (app, _) = app(config()).await?;
    let response = app
        .oneshot(Request::builder().uri("/openapi.json").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert!(body["paths"]["/v1/session/login"].is_object());
    assert!(body["paths"]["/v1/session/me"].is_object());
    Ok(())
}

#[tokio::test]
async fn login_me_logout() -> Result<()> {
    let (app, _) = app(config().with_persistent_tokens(true)).await?;

    let response = app.clone().oneshot(login_request("correct horse")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["ok"], true);
    assert_eq!(body["error"]["code"], 0);
    assert!(body["user"].get("password_hash").is_none());
    let token = body["token"].as_str().unwrap().to_string();

    let me = || {
        Request::builder()
            .uri("/v1/session/me")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(me()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["user"]["id"], 7);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/session/logout")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(me()).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], 3);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_unauthorized() -> Result<()> {
    let (app, store) = app(config()).await?;
    let response = app.oneshot(login_request("wrong")).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["error"]["code"], 2);
    assert_eq!(body["captcha_required"], false);
    assert_eq!(store.attempts().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_payload_is_bad_request() -> Result<()> {
    let (app, _) = app(config()).await?;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/session/login")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn me_without_token_is_unauthorized() -> Result<()> {
    let (app, _) = app(config()).await?;
    let response = app
        .oneshot(Request::builder().uri("/v1/session/me").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn captcha_flow_after_failed_login() -> Result<()> {
    let (app, store) = app(config().with_captcha(true).with_max_login_attempts(1)).await?;

    let response = app.clone().oneshot(login_request("wrong")).await?;
    let body = json_body(response).await?;
    assert_eq!(body["captcha_required"], true);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/session/captcha?login_id=ana@example.com")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["style"], "classic");
    assert!(body["site_key"].is_null());
    let captcha_id = body["captcha_id"].as_str().unwrap().to_string();

    let image = || {
        Request::builder()
            .uri(format!("/v1/session/captcha/image?id={captcha_id}"))
            .body(Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(image()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let png = to_bytes(response.into_body(), usize::MAX).await?;
    assert!(png.starts_with(b"\x89PNG"));

    let response = app.clone().oneshot(image()).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let value = store
        .challenges()
        .await
        .into_iter()
        .find(|c| c.challenge_id == captcha_id)
        .map(|c| c.value)
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/session/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "login_id": "ana@example.com",
                        "password": "correct horse",
                        "captcha_id": captcha_id,
                        "captcha_value": value,
                    })
                    .to_string(),
                ))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["ok"], true);
    Ok(())
}

#[tokio::test]
async fn recaptcha_style_hands_out_site_key() -> Result<()> {
    let (app, store) = app(
        config()
            .with_captcha(true)
            .with_captcha_style(Configurable::Static(CaptchaStyle::Recaptcha))
            .with_recaptcha(
                Configurable::Static(SecretString::from("server-secret")),
                Some("public-site-key".to_string()),
            ),
    )
    .await?;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/session/captcha?login_id=ana@example.com")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["style"], "google_recaptcha_v3");
    assert_eq!(body["site_key"], "public-site-key");
    assert!(body["captcha_id"].is_null());
    assert!(store.challenges().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn captcha_image_for_unknown_id_is_bad_request() -> Result<()> {
    let (app, _) = app(config()).await?;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/session/captcha/image?id=missing")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
