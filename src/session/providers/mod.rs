//! Identity providers and the fixed-order chain that consults them.
//!
//! Federated providers run first, in order, and the first non-abstain outcome
//! ends that phase. The native provider always runs unless a federated
//! provider authenticated the user. Provider faults are logged and treated as
//! abstain.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::session::{context::RequestMetadata, user::User};

pub mod avatar;
pub mod moodle;
pub mod native;
pub mod social;

pub use avatar::{AvatarFetcher, AvatarStore, FsAvatarStore};
pub use moodle::MoodleProvider;
pub use native::{hash_secret, verify_secret, NativeProvider};
pub use social::{FacebookVerifier, GoogleVerifier, SocialProfile, SocialVerifier};

#[derive(Clone, Debug)]
pub struct Credentials {
    pub login_id: String,
    pub secret: SecretString,
    pub metadata: RequestMetadata,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Authenticated(User),
    Abstain,
    /// Rejected; carries the resolved user, if any, so callers can scope follow-ups.
    Deny(Option<User>),
}

impl Outcome {
    #[must_use]
    pub fn into_parts(self) -> (bool, Option<User>) {
        match self {
            Self::Authenticated(user) => (true, Some(user)),
            Self::Abstain => (false, None),
            Self::Deny(user) => (false, user),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, credentials: &Credentials) -> Result<Outcome>;
}

pub struct ProviderChain {
    federated: Vec<Arc<dyn IdentityProvider>>,
    native: Arc<dyn IdentityProvider>,
}

impl ProviderChain {
    #[must_use]
    pub fn new(native: Arc<dyn IdentityProvider>) -> Self {
        Self {
            federated: Vec::new(),
            native,
        }
    }

    #[must_use]
    pub fn with_federated(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.federated.push(provider);
        self
    }

    /// Returns `(authenticated, user)`; on failure `user` is whatever the
    /// native provider resolved for the login id.
    #[instrument(skip_all, fields(login_id = %credentials.login_id))]
    pub async fn authenticate(&self, credentials: &Credentials) -> (bool, Option<User>) {
        for provider in &self.federated {
            match provider.authenticate(credentials).await {
                Ok(Outcome::Authenticated(user)) => return (true, Some(user)),
                Ok(Outcome::Deny(_)) => break,
                Ok(Outcome::Abstain) => {}
                Err(err) => {
                    warn!(provider = provider.name(), "identity provider failed: {err:#}");
                }
            }
        }

        match self.native.authenticate(credentials).await {
            Ok(outcome) => outcome.into_parts(),
            Err(err) => {
                warn!(
                    provider = self.native.name(),
                    "identity provider failed: {err:#}"
                );
                (false, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        outcome: Option<Outcome>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(outcome: Option<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IdentityProvider for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn authenticate(&self, _credentials: &Credentials) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn user(id: i64) -> User {
        User {
            id,
            active: true,
            ..User::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            login_id: "ana".to_string(),
            secret: SecretString::from("pw"),
            metadata: RequestMetadata::default(),
        }
    }

    #[tokio::test]
    async fn federated_success_skips_native() {
        let native = Fixed::new(Some(Outcome::Deny(None)));
        let chain = ProviderChain::new(native.clone())
            .with_federated(Fixed::new(Some(Outcome::Authenticated(user(5)))));
        let (ok, resolved) = chain.authenticate(&credentials()).await;
        assert!(ok);
        assert_eq!(resolved.map(|u| u.id), Some(5));
        assert_eq!(native.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deny_stops_federation_but_native_still_runs() {
        let second = Fixed::new(Some(Outcome::Authenticated(user(9))));
        let native = Fixed::new(Some(Outcome::Authenticated(user(1))));
        let chain = ProviderChain::new(native.clone())
            .with_federated(Fixed::new(Some(Outcome::Deny(Some(user(5))))))
            .with_federated(second.clone());
        let (ok, resolved) = chain.authenticate(&credentials()).await;
        assert!(ok);
        assert_eq!(resolved.map(|u| u.id), Some(1));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn faults_become_abstain() {
        let chain = ProviderChain::new(Fixed::new(None)).with_federated(Fixed::new(None));
        assert_eq!(chain.authenticate(&credentials()).await, (false, None));

        let native = Fixed::new(Some(Outcome::Deny(Some(user(3)))));
        let chain = ProviderChain::new(native).with_federated(Fixed::new(None));
        let (ok, resolved) = chain.authenticate(&credentials()).await;
        assert!(!ok);
        assert_eq!(resolved.map(|u| u.id), Some(3));
    }
}
