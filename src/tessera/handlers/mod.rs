//! Route handlers and the request plumbing they share.

pub mod captcha;
pub mod health;
pub mod login;
pub mod me;
pub mod middleware;
pub mod social;

use crate::session::{AuthInfo, ErrorCode, ErrorMessage, RequestContext};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use std::convert::Infallible;

/// HTTP status for a catalog entry.
#[must_use]
pub fn status_for(error: &ErrorMessage) -> StatusCode {
    match error.error_code() {
        ErrorCode::NoError => StatusCode::OK,
        ErrorCode::InvalidCredentials
        | ErrorCode::InvalidToken
        | ErrorCode::ExpiredToken
        | ErrorCode::InvalidCaptcha => StatusCode::UNAUTHORIZED,
        ErrorCode::AccessDenied
        | ErrorCode::InsufficientPermissions
        | ErrorCode::SuspendedUser => StatusCode::FORBIDDEN,
        ErrorCode::InstanceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::UserAlreadyExists => StatusCode::CONFLICT,
        ErrorCode::Unknown | ErrorCode::Internal | ErrorCode::BadGeneratedToken => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = Self::from_headers(&parts.headers);
        Ok(match parts.extensions.get::<AuthInfo>() {
            Some(info) => context.with_auth_info(info.clone()),
            None => context,
        })
    }
}
