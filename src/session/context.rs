//! Per-request inputs to the session manager.

use crate::session::{error::ErrorMessage, user::User};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bearer token resolution computed once per request (see the HTTP middleware).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuthInfo {
    pub valid: bool,
    pub user: Option<User>,
    pub error: ErrorMessage,
}

impl AuthInfo {
    #[must_use]
    pub fn valid(user: User) -> Self {
        Self {
            valid: true,
            user: Some(user),
            error: ErrorMessage::default(),
        }
    }

    #[must_use]
    pub fn invalid(error: ErrorMessage) -> Self {
        Self {
            valid: false,
            user: None,
            error,
        }
    }
}

/// Client details stored next to issued tokens and failed attempts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RequestMetadata {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            client_ip: extract_client_ip(headers),
            user_agent: header_str(headers, "user-agent"),
            request_id: header_str(headers, "x-request-id"),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        if self == &Self::default() {
            return None;
        }
        serde_json::to_value(self).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    headers: HeaderMap,
    bearer: Option<String>,
    auth_info: Option<AuthInfo>,
    metadata: RequestMetadata,
}

impl RequestContext {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            bearer: extract_bearer_token(headers),
            metadata: RequestMetadata::from_headers(headers),
            headers: headers.clone(),
            auth_info: None,
        }
    }

    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_auth_info(mut self, auth_info: AuthInfo) -> Self {
        self.auth_info = Some(auth_info);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    #[must_use]
    pub const fn auth_info(&self) -> Option<&AuthInfo> {
        self.auth_info.as_ref()
    }

    #[must_use]
    pub const fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    header_str(headers, "x-real-ip")
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
