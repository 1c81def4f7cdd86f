//! Federated login against Moodle LMS instances.
//!
//! Flow Overview:
//! 1. POST the credentials to `{url}/login/token.php` for the mobile service.
//! 2. When Moodle hands back a token, look the profile up through the REST
//!    web service with the endpoint's own service token.
//! 3. Map the profile to a local account by the configured id field,
//!    provisioning one when it does not exist yet.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{AvatarFetcher, Credentials, IdentityProvider, Outcome};
use crate::session::{
    attempts::AttemptLedger,
    config::{FederatedEndpoint, SessionConfig},
    store::SessionStore,
    user::NewUser,
};

const MOBILE_SERVICE: &str = "moodle_mobile_app";
const USERS_BY_FIELD: &str = "core_user_get_users_by_field";

pub struct MoodleProvider {
    config: Arc<SessionConfig>,
    client: reqwest::Client,
    store: Arc<dyn SessionStore>,
    ledger: Arc<AttemptLedger>,
    avatars: AvatarFetcher,
}

impl MoodleProvider {
    #[must_use]
    pub fn new(
        config: Arc<SessionConfig>,
        client: reqwest::Client,
        store: Arc<dyn SessionStore>,
        ledger: Arc<AttemptLedger>,
        avatars: AvatarFetcher,
    ) -> Self {
        Self {
            config,
            client,
            store,
            ledger,
            avatars,
        }
    }

    #[instrument(skip_all, fields(endpoint = %endpoint.url))]
    async fn authenticate_at(
        &self,
        endpoint: &FederatedEndpoint,
        credentials: &Credentials,
    ) -> Result<Outcome> {
        let auth_field = self.config.moodle_auth_field();
        let response = self
            .client
            .post(format!("{}/login/token.php", endpoint.url))
            .form(&[
                (auth_field, credentials.login_id.as_str()),
                ("password", credentials.secret.expose_secret()),
                ("service", MOBILE_SERVICE),
            ])
            .send()
            .await
            .context("moodle token request failed")?;

        if response.status() != StatusCode::OK {
            debug!("moodle token endpoint returned {}", response.status());
            return Ok(Outcome::Abstain);
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse moodle token response")?;
        if body.get("token").is_none() {
            self.ledger
                .record(
                    &credentials.login_id,
                    &credentials.secret,
                    None,
                    &credentials.metadata,
                )
                .await?;
            return Ok(Outcome::Abstain);
        }

        let profiles: Value = self
            .client
            .post(format!("{}/webservice/rest/server.php", endpoint.url))
            .form(&[
                ("wstoken", endpoint.token.expose_secret()),
                ("wsfunction", USERS_BY_FIELD),
                ("moodlewsrestformat", "json"),
                ("field", auth_field),
                ("values[0]", credentials.login_id.as_str()),
            ])
            .send()
            .await
            .context("moodle profile request failed")?
            .error_for_status()
            .context("moodle profile request returned an error status")?
            .json()
            .await
            .context("failed to parse moodle profile response")?;

        let Some(profile) = profiles.as_array().and_then(|profiles| profiles.first()) else {
            return Ok(Outcome::Abstain);
        };
        let Some(local_login) = profile_str(profile, self.config.moodle_id_field()) else {
            warn!(
                "moodle profile has no {} field",
                self.config.moodle_id_field()
            );
            return Ok(Outcome::Abstain);
        };

        match self.store.find_user_by_login_id(&local_login).await? {
            Some(user) if user.active => Ok(Outcome::Authenticated(user)),
            Some(user) => {
                self.ledger
                    .record(
                        &credentials.login_id,
                        &credentials.secret,
                        Some(user.id),
                        &credentials.metadata,
                    )
                    .await?;
                Ok(Outcome::Deny(None))
            }
            None => {
                let avatar = if self.config.user_fields().avatar.is_some() {
                    self.avatars
                        .fetch(profile.get("profileimageurl").and_then(Value::as_str))
                        .await
                } else {
                    None
                };
                let user = self
                    .store
                    .insert_user(NewUser {
                        login_id: local_login,
                        role: self.config.provisioned_role().map(ToString::to_string),
                        active: true,
                        name: profile_str(profile, "fullname").unwrap_or_default(),
                        avatar,
                        ..NewUser::default()
                    })
                    .await?;
                debug!(user_id = user.id, "provisioned user from moodle");
                Ok(Outcome::Authenticated(user))
            }
        }
    }
}

fn profile_str(profile: &Value, field: &str) -> Option<String> {
    match profile.get(field)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

#[async_trait]
impl IdentityProvider for MoodleProvider {
    fn name(&self) -> &'static str {
        "moodle"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Outcome> {
        for endpoint in self.config.federated_endpoints() {
            match self.authenticate_at(&endpoint, credentials).await {
                Ok(Outcome::Abstain) => {}
                Ok(outcome) => return Ok(outcome),
                Err(err) => warn!(endpoint = %endpoint.url, "moodle login failed: {err:#}"),
            }
        }
        Ok(Outcome::Abstain)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{
        clock::SystemClock,
        config::Configurable,
        context::RequestMetadata,
        store::{MemoryStore, UserStore},
        user::User,
    };
    use secrecy::SecretString;
    use serde_json::json;
    use std::net::TcpListener;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn provider(urls: &[String]) -> (MoodleProvider, Arc<MemoryStore>) {
        let endpoints = urls
            .iter()
            .map(|url| FederatedEndpoint::new(url, SecretString::from("ws-token")))
            .collect();
        let config = Arc::new(
            SessionConfig::new(SecretString::from("k"))
                .with_federated_endpoints(Configurable::Static(endpoints))
                .with_provisioned_role(Some("student".to_string())),
        );
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(AttemptLedger::new(
            config.clone(),
            store.clone(),
            Arc::new(SystemClock),
        ));
        let provider = MoodleProvider::new(
            config,
            reqwest::Client::new(),
            store.clone(),
            ledger,
            AvatarFetcher::new(reqwest::Client::new(), None),
        );
        (provider, store)
    }

    fn credentials() -> Credentials {
        Credentials {
            login_id: "ana".to_string(),
            secret: SecretString::from("pw"),
            metadata: RequestMetadata::default(),
        }
    }

    async fn mount_login(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/login/token.php"))
            .and(body_string_contains("username=ana"))
            .and(body_string_contains("service=moodle_mobile_app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_profile(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/webservice/rest/server.php"))
            .and(body_string_contains("wsfunction=core_user_get_users_by_field"))
            .and(body_string_contains("wstoken=ws-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 31,
                "username": "ana",
                "fullname": "Ana Lopez",
                "email": "ana@school.edu",
                "profileimageurl": ""
            }])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn provisions_missing_users() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "t", "privatetoken": null})).await;
        mount_profile(&server).await;

        let (provider, store) = provider(&[server.uri()]);
        let outcome = provider.authenticate(&credentials()).await?;
        let Outcome::Authenticated(user) = outcome else {
            panic!("expected authentication, got {outcome:?}");
        };
        assert_eq!(user.login_id, "ana@school.edu");
        assert_eq!(user.name, "Ana Lopez");
        assert_eq!(user.role, "student");
        assert!(user.active);
        assert!(store.find_user_by_login_id("ana@school.edu").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn inactive_local_user_is_denied() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        mount_login(&server, json!({"token": "t"})).await;
        mount_profile(&server).await;

        let (provider, store) = provider(&[server.uri()]);
        store
            .put_user(User {
                id: 4,
                login_id: "ana@school.edu".to_string(),
                active: false,
                ..User::default()
            })
            .await;
        assert_eq!(provider.authenticate(&credentials()).await?, Outcome::Deny(None));
        let attempts = store.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].user_id, Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_login_records_attempt_and_tries_next_endpoint() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let rejecting = MockServer::start().await;
        mount_login(&rejecting, json!({"error": "Invalid login", "errorcode": "invalidlogin"})).await;
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&broken)
            .await;
        let accepting = MockServer::start().await;
        mount_login(&accepting, json!({"token": "t"})).await;
        mount_profile(&accepting).await;

        let (provider, store) = provider(&[rejecting.uri(), broken.uri(), accepting.uri()]);
        let outcome = provider.authenticate(&credentials()).await?;
        assert!(matches!(outcome, Outcome::Authenticated(_)));
        let attempts = store.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].user_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn no_endpoints_abstain() -> Result<()> {
        let (provider, _) = provider(&[]);
        assert_eq!(provider.authenticate(&credentials()).await?, Outcome::Abstain);
        Ok(())
    }
}
