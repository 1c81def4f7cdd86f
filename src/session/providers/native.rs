use anyhow::{anyhow, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::instrument;

use super::{Credentials, IdentityProvider, Outcome};
use crate::session::{attempts::AttemptLedger, store::SessionStore};

/// Check `secret` against an Argon2 PHC string. Missing or unparsable hashes never match.
#[must_use]
pub fn verify_secret(secret: &SecretString, hash: Option<&str>) -> bool {
    let Some(parsed) = hash.and_then(|hash| PasswordHash::new(hash).ok()) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.expose_secret().as_bytes(), &parsed)
        .is_ok()
}

/// Hash a secret into an Argon2id PHC string, for provisioning local accounts.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash secret"))?
        .to_string();
    Ok(hash)
}

/// Local accounts with Argon2 hashed secrets.
pub struct NativeProvider {
    store: Arc<dyn SessionStore>,
    ledger: Arc<AttemptLedger>,
}

impl NativeProvider {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, ledger: Arc<AttemptLedger>) -> Self {
        Self { store, ledger }
    }
}

#[async_trait]
impl IdentityProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    #[instrument(skip_all, fields(login_id = %credentials.login_id))]
    async fn authenticate(&self, credentials: &Credentials) -> Result<Outcome> {
        let user = self
            .store
            .find_user_by_login_id(&credentials.login_id)
            .await?;

        match user {
            Some(user)
                if user.active
                    && verify_secret(&credentials.secret, user.password_hash.as_deref()) =>
            {
                Ok(Outcome::Authenticated(user))
            }
            Some(user) => {
                self.ledger
                    .record(
                        &credentials.login_id,
                        &credentials.secret,
                        Some(user.id),
                        &credentials.metadata,
                    )
                    .await?;
                Ok(Outcome::Deny(Some(user)))
            }
            None => {
                self.ledger
                    .record(
                        &credentials.login_id,
                        &credentials.secret,
                        None,
                        &credentials.metadata,
                    )
                    .await?;
                Ok(Outcome::Deny(None))
            }
        }
    }
}
