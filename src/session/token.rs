//! Signed session tokens.
//!
//! Tokens are compact HS256 JWTs carrying [`SessionClaims`]. Verification
//! order: structure, algorithm, signature, expiry, partition, persisted record
//! (persistent mode), then the user behind the claims.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument};
use ulid::Ulid;

use crate::session::{
    clock::Clock,
    config::{KeyContext, SessionConfig},
    context::RequestMetadata,
    error::{ErrorCode, ErrorMessage},
    store::{NewTokenRecord, SessionStore},
    user::User,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub session_id: String,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn mac(key: &[u8], signing_input: &str) -> Result<HmacSha256, TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// Create an HS256 signed session token.
///
/// # Errors
/// Returns an error if the claims cannot be encoded.
pub fn sign_hs256(key: &[u8], claims: &SessionClaims) -> Result<String, TokenError> {
    let header_b64 = b64e_json(&TokenHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature = mac(key, &signing_input)?.finalize().into_bytes();
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify an HS256 session token and return its claims.
///
/// # Errors
/// Returns an error if the token is malformed, the signature does not match
/// (constant-time comparison) or `exp` is not after `now_unix_seconds`.
pub fn verify_hs256(
    token: &str,
    key: &[u8],
    now_unix_seconds: i64,
) -> Result<SessionClaims, TokenError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(TokenError::TokenFormat);
    }

    let header: TokenHeader = b64d_json(header_b64)?;
    if header.alg != "HS256" {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    mac(key, &format!("{header_b64}.{claims_b64}"))?
        .verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: SessionClaims = b64d_json(claims_b64)?;
    if let Some(exp) = claims.exp {
        if exp <= now_unix_seconds {
            return Err(TokenError::Expired);
        }
    }

    Ok(claims)
}

pub struct TokenService {
    config: Arc<SessionConfig>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    #[must_use]
    pub fn new(
        config: Arc<SessionConfig>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Sign a token for `user`. `ttl_hours <= 0` issues a token without expiry.
    /// In persistent mode the record is stored before the token is returned.
    ///
    /// # Errors
    /// Returns an error if signing or persisting fails.
    #[instrument(skip(self, user, metadata), fields(user_id = user.id))]
    pub async fn issue(
        &self,
        user: &User,
        ttl_hours: i64,
        metadata: &RequestMetadata,
    ) -> Result<String> {
        let now = self.clock.now();
        let claims = SessionClaims {
            session_id: Ulid::new().to_string(),
            user_id: user.id,
            session_key: self.config.session_key().map(ToString::to_string),
            exp: (ttl_hours > 0).then(|| (now + Duration::hours(ttl_hours)).timestamp()),
        };

        let key = self.config.security_key().resolve(&KeyContext::Issue {
            user_id: user.id,
            login_id: user.login_id.clone(),
        });
        let token = sign_hs256(key.expose_secret().as_bytes(), &claims)
            .context("failed to sign session token")?;

        if self.config.persistent_tokens() {
            self.store
                .insert_token(NewTokenRecord {
                    token: token.clone(),
                    session_key: claims.session_key,
                    user_id: user.id,
                    request_metadata: metadata.to_json(),
                    created_at: now,
                })
                .await?;
        }

        debug!("session token issued");
        Ok(token)
    }

    /// Resolve the active user behind `token`.
    ///
    /// # Errors
    /// Returns the catalog entry describing why the token is not usable.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<User, ErrorMessage> {
        let key = self.config.security_key().resolve(&KeyContext::Verify {
            token: token.to_string(),
        });
        let now = self.clock.now().timestamp();

        let claims = match verify_hs256(token, key.expose_secret().as_bytes(), now) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => return Err(ErrorCode::ExpiredToken.to_message()),
            Err(err) => {
                debug!("rejected session token: {err}");
                return Err(ErrorCode::InvalidToken.with_diagnostic(err));
            }
        };

        if claims.session_key.as_deref() != self.config.session_key() {
            debug!("rejected session token: partition mismatch");
            return Err(ErrorCode::InvalidToken.to_message());
        }

        if self.config.persistent_tokens() {
            match self
                .store
                .token_is_active(token, claims.session_key.as_deref(), claims.user_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => return Err(ErrorCode::InvalidToken.to_message()),
                Err(err) => {
                    error!("Failed to lookup token record: {err:#}");
                    return Err(ErrorCode::InvalidToken.with_diagnostic(format!("{err:#}")));
                }
            }
        }

        let user = match self.store.find_user_by_id(claims.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(ErrorCode::InvalidCredentials.to_message()),
            Err(err) => {
                error!("Failed to lookup token user: {err:#}");
                return Err(ErrorCode::InvalidToken.with_diagnostic(format!("{err:#}")));
            }
        };

        if !user.active {
            return Err(ErrorCode::AccessDenied.to_message());
        }

        Ok(user)
    }

    /// Flip the persisted record inactive. Always `false` outside persistent mode.
    ///
    /// # Errors
    /// Returns an error if the store update fails.
    #[instrument(skip_all)]
    pub async fn revoke(&self, token: &str) -> Result<bool> {
        if !self.config.persistent_tokens() {
            return Ok(false);
        }
        self.store
            .deactivate_token(token, self.config.session_key(), self.clock.now())
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{clock::ManualClock, store::MemoryStore};
    use chrono::Utc;
    use secrecy::SecretString;

    const KEY: &[u8] = b"test-signing-key";

    fn claims(exp: Option<i64>) -> SessionClaims {
        SessionClaims {
            session_id: Ulid::new().to_string(),
            user_id: 42,
            session_key: Some("web".to_string()),
            exp,
        }
    }

    fn user(id: i64, active: bool) -> User {
        User {
            id,
            login_id: format!("user{id}@example.com"),
            role: "user".to_string(),
            active,
            ..User::default()
        }
    }

    async fn service(
        config: SessionConfig,
    ) -> (TokenService, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        store.put_user(user(1, true)).await;
        store.put_user(user(2, false)).await;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = TokenService::new(Arc::new(config), store.clone(), clock.clone());
        (service, store, clock)
    }

    #[test]
    fn sign_and_verify() {
        let claims = claims(Some(2_000));
        let token = sign_hs256(KEY, &claims).unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(verify_hs256(&token, KEY, 1_000).unwrap(), claims);
    }

    #[test]
    fn verify_rejects_wrong_key_and_tampering() {
        let token = sign_hs256(KEY, &claims(None)).unwrap();
        assert!(matches!(
            verify_hs256(&token, b"other-key", 0),
            Err(TokenError::InvalidSignature)
        ));

        let forged = b64e_json(&SessionClaims {
            user_id: 1,
            ..claims(None)
        })
        .unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged;
        assert!(matches!(
            verify_hs256(&parts.join("."), KEY, 0),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_reports_expiry_after_signature() {
        let token = sign_hs256(KEY, &claims(Some(1_000))).unwrap();
        assert!(matches!(
            verify_hs256(&token, KEY, 1_000),
            Err(TokenError::Expired)
        ));
        assert!(matches!(
            verify_hs256(&token, b"other-key", 5_000),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_rejects_malformed_tokens() {
        assert!(matches!(verify_hs256("abc", KEY, 0), Err(TokenError::TokenFormat)));
        assert!(matches!(verify_hs256("a.b.c.d", KEY, 0), Err(TokenError::TokenFormat)));
        assert!(matches!(verify_hs256("!!.b.c", KEY, 0), Err(TokenError::Base64)));

        let header = b64e_json(&TokenHeader {
            alg: "none".to_string(),
            typ: "JWT".to_string(),
        })
        .unwrap();
        let body = b64e_json(&claims(None)).unwrap();
        assert!(matches!(
            verify_hs256(&format!("{header}.{body}.sig"), KEY, 0),
            Err(TokenError::UnsupportedAlg(_))
        ));
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let (service, _, clock) = service(SessionConfig::new(SecretString::from("k"))).await;
        let token = service
            .issue(&user(1, true), 0, &RequestMetadata::default())
            .await
            .unwrap();
        clock.advance(Duration::days(3650));
        assert_eq!(service.verify(&token).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn ttl_expires_when_clock_passes() {
        let (service, _, clock) = service(SessionConfig::new(SecretString::from("k"))).await;
        let token = service
            .issue(&user(1, true), 2, &RequestMetadata::default())
            .await
            .unwrap();
        clock.advance(Duration::minutes(119));
        assert!(service.verify(&token).await.is_ok());
        clock.advance(Duration::minutes(2));
        let err = service.verify(&token).await.unwrap_err();
        assert!(err.is(ErrorCode::ExpiredToken));
    }

    #[tokio::test]
    async fn partition_mismatch_is_rejected() {
        let web = SessionConfig::new(SecretString::from("k")).with_session_key(Some("web".into()));
        let (issuer, _, _) = service(web).await;
        let token = issuer
            .issue(&user(1, true), 0, &RequestMetadata::default())
            .await
            .unwrap();

        let mobile =
            SessionConfig::new(SecretString::from("k")).with_session_key(Some("mobile".into()));
        let (mobile, _, _) = service(mobile).await;
        assert!(mobile.verify(&token).await.unwrap_err().is(ErrorCode::InvalidToken));

        let (unpartitioned, _, _) = service(SessionConfig::new(SecretString::from("k"))).await;
        assert!(unpartitioned
            .verify(&token)
            .await
            .unwrap_err()
            .is(ErrorCode::InvalidToken));
    }

    #[tokio::test]
    async fn inactive_and_missing_users() {
        let (service, _, _) = service(SessionConfig::new(SecretString::from("k"))).await;
        let meta = RequestMetadata::default();

        let token = service.issue(&user(2, false), 0, &meta).await.unwrap();
        assert!(service.verify(&token).await.unwrap_err().is(ErrorCode::AccessDenied));

        let token = service.issue(&user(99, true), 0, &meta).await.unwrap();
        assert!(service
            .verify(&token)
            .await
            .unwrap_err()
            .is(ErrorCode::InvalidCredentials));
    }

    #[tokio::test]
    async fn persistent_tokens_need_an_active_record() {
        let config = SessionConfig::new(SecretString::from("k"))
            .with_persistent_tokens(true)
            .with_session_key(Some("web".into()));
        let (service, store, _) = service(config).await;
        let metadata = RequestMetadata {
            client_ip: Some("10.0.0.1".to_string()),
            ..RequestMetadata::default()
        };

        let token = service.issue(&user(1, true), 0, &metadata).await.unwrap();
        let record = store.token_record(&token).await.unwrap();
        assert!(record.active);
        assert_eq!(record.session_key.as_deref(), Some("web"));
        assert_eq!(
            record.request_metadata,
            Some(serde_json::json!({"client_ip": "10.0.0.1"}))
        );
        assert!(service.verify(&token).await.is_ok());

        assert!(service.revoke(&token).await.unwrap());
        assert!(service.verify(&token).await.unwrap_err().is(ErrorCode::InvalidToken));
        assert!(store.token_record(&token).await.unwrap().inactive_at.is_some());
        assert!(!service.revoke(&token).await.unwrap());
    }

    #[tokio::test]
    async fn derived_key_sees_issue_and_verify_context() {
        let key = crate::session::config::Configurable::derived(|context: &KeyContext| {
            match context {
                KeyContext::Issue { user_id, .. } => SecretString::from(format!("user-{user_id}")),
                KeyContext::Verify { .. } => SecretString::from("user-1"),
            }
        });
        let config = SessionConfig::new(SecretString::from("unused")).with_security_key(key);
        let (service, _, _) = service(config).await;
        let meta = RequestMetadata::default();

        let token = service.issue(&user(1, true), 0, &meta).await.unwrap();
        assert!(service.verify(&token).await.is_ok());

        let other = TokenService::new(
            Arc::new(SessionConfig::new(SecretString::from("user-1"))),
            Arc::new(MemoryStore::new()),
            Arc::new(crate::session::clock::SystemClock),
        );
        assert!(other.verify(&token).await.unwrap_err().is(ErrorCode::InvalidCredentials));
    }
}
