//! Login challenges (captcha) gating repeated failures.
//!
//! Flow Overview:
//! - A challenge is required once the attempt ledger shows at least
//!   `max_login_attempts` failures in the trailing hour for the user (or the
//!   whole partition when the login id did not resolve).
//! - Classic challenges are issued on demand, capped per hour, and expire after
//!   `captcha_expiration_minutes`. Expiry is applied lazily before each read.
//! - The image for a classic challenge can be fetched exactly once.
//! - The reCAPTCHA style delegates the decision to Google's verify endpoint.

use anyhow::Result;
use chrono::Duration;
use rand::{rngs::OsRng, Rng};
use std::sync::Arc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::session::{
    attempts::AttemptLedger,
    clock::Clock,
    config::{CaptchaStyle, SessionConfig},
    context::RequestContext,
    store::{LoginChallenge, SessionStore},
    user::User,
};

pub mod recaptcha;
pub mod render;

pub use recaptcha::RecaptchaVerifier;

pub const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// What the client sent back for a challenge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChallengeAnswer {
    pub captcha_id: Option<String>,
    pub captcha_value: Option<String>,
    pub recaptcha_token: Option<String>,
}

fn challenge_value(length: usize) -> String {
    let alphabet = ALPHABET.as_bytes();
    (0..length)
        .map(|_| char::from(alphabet[OsRng.gen_range(0..alphabet.len())]))
        .collect()
}

pub struct ChallengeManager {
    config: Arc<SessionConfig>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    ledger: Arc<AttemptLedger>,
    recaptcha: RecaptchaVerifier,
}

impl ChallengeManager {
    #[must_use]
    pub fn new(
        config: Arc<SessionConfig>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        ledger: Arc<AttemptLedger>,
        recaptcha: RecaptchaVerifier,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            ledger,
            recaptcha,
        }
    }

    /// # Errors
    /// Returns an error if the attempt count cannot be read.
    pub async fn is_required(&self, user: Option<&User>) -> Result<bool> {
        if !self.config.captcha_enabled() {
            return Ok(false);
        }
        let failures = self.ledger.recent_failures(user.map(|u| u.id)).await?;
        Ok(failures >= u64::from(self.config.max_login_attempts()))
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff =
            self.clock.now() - Duration::minutes(self.config.captcha_expiration_minutes());
        self.store
            .expire_challenges(self.config.session_key(), cutoff)
            .await?;
        Ok(())
    }

    /// Issue a challenge and return its id, or `None` when no challenge is
    /// required or the hourly cap is reached.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    #[instrument(skip_all, fields(user_id = ?user.map(|u| u.id)))]
    pub async fn generate(&self, user: Option<&User>) -> Result<Option<String>> {
        if !self.is_required(user).await? {
            return Ok(None);
        }
        self.sweep().await?;

        let now = self.clock.now();
        let challenge = LoginChallenge {
            challenge_id: Uuid::new_v4().to_string(),
            value: challenge_value(self.config.captcha_length()),
            active: true,
            image_rendered: false,
            session_key: self.config.session_key().map(ToString::to_string),
            user_id: user.map(|u| u.id),
            created_at: now,
        };
        let challenge_id = challenge.challenge_id.clone();

        let inserted = self
            .store
            .insert_challenge_within_cap(
                challenge,
                now - Duration::hours(1),
                self.config.max_captcha_by_user(),
            )
            .await?;
        if !inserted {
            warn!("captcha limit reached");
        }
        Ok(inserted.then_some(challenge_id))
    }

    /// Check the client's answer. Succeeds without looking at the answer when
    /// no challenge is currently required.
    ///
    /// # Errors
    /// Returns an error if the store fails; remote verification failures count
    /// as a rejected answer.
    #[instrument(skip_all, fields(user_id = ?user.map(|u| u.id)))]
    pub async fn validate(
        &self,
        user: Option<&User>,
        answer: &ChallengeAnswer,
        context: &RequestContext,
    ) -> Result<bool> {
        if !self.is_required(user).await? {
            return Ok(true);
        }

        match self.config.captcha_style(context) {
            CaptchaStyle::Classic => {
                let (Some(id), Some(value)) = (&answer.captcha_id, &answer.captcha_value) else {
                    return Ok(false);
                };
                self.sweep().await?;
                self.store
                    .challenge_matches(
                        self.config.session_key(),
                        user.map(|u| u.id),
                        id,
                        value,
                    )
                    .await
            }
            CaptchaStyle::Recaptcha => {
                let Some(token) = &answer.recaptcha_token else {
                    return Ok(false);
                };
                let Some(secret) = self.config.recaptcha_secret() else {
                    error!("reCAPTCHA style selected without a secret key");
                    return Ok(false);
                };
                match self.recaptcha.verify(&secret, token).await {
                    Ok(valid) => Ok(valid),
                    Err(err) => {
                        warn!("reCAPTCHA verification failed: {err:#}");
                        Ok(false)
                    }
                }
            }
        }
    }

    /// PNG for an active challenge that has not been rendered yet.
    ///
    /// # Errors
    /// Returns an error if the store fails or the image cannot be encoded.
    #[instrument(skip(self))]
    pub async fn render(&self, challenge_id: &str) -> Result<Option<Vec<u8>>> {
        self.sweep().await?;
        let Some(value) = self
            .store
            .mark_challenge_rendered(self.config.session_key(), challenge_id)
            .await?
        else {
            return Ok(None);
        };
        render::render_png(&value).map(Some)
    }
}
