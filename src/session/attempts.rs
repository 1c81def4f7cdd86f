//! Append-only ledger of failed logins, scoped to the configured partition.

use anyhow::Result;
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::session::{
    clock::Clock,
    config::SessionConfig,
    context::RequestMetadata,
    store::{FailedLoginAttempt, SessionStore},
};

pub struct AttemptLedger {
    config: Arc<SessionConfig>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl AttemptLedger {
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

    /// # Errors
    /// Returns an error if the store rejects the write.
    #[instrument(skip(self, secret, metadata))]
    pub async fn record(
        &self,
        login_id: &str,
        secret: &SecretString,
        user_id: Option<i64>,
        metadata: &RequestMetadata,
    ) -> Result<()> {
        warn!("failed login attempt");
        self.store
            .insert_attempt(FailedLoginAttempt {
                login_id: login_id.to_string(),
                secret: self
                    .config
                    .retain_failed_secrets()
                    .then(|| secret.expose_secret().to_string()),
                session_key: self.config.session_key().map(ToString::to_string),
                user_id,
                request_metadata: metadata.to_json(),
                created_at: self.clock.now(),
            })
            .await
    }

    /// Failures in the trailing hour for `user_id`, or for the whole partition.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn recent_failures(&self, user_id: Option<i64>) -> Result<u64> {
        let since = self.clock.now() - Duration::hours(1);
        self.store
            .count_attempts(self.config.session_key(), user_id, since)
            .await
    }
}
