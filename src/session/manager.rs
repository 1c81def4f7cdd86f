//! The public face of the session core.
//!
//! [`SessionManager`] wires the token service, the attempt ledger, the
//! challenge manager and the identity provider chain together and exposes
//! the operations the HTTP boundary (or any embedding host) calls. Every
//! operation reports through an [`ErrorMessage`]; internal faults never
//! escape as errors.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::session::{
    attempts::AttemptLedger,
    captcha::{ChallengeAnswer, ChallengeManager, RecaptchaVerifier},
    clock::{Clock, SystemClock},
    config::SessionConfig,
    context::{AuthInfo, RequestContext},
    error::{ErrorCode, ErrorMessage},
    groups::{GroupManager, GROUP_ALL, GROUP_OPEN},
    providers::{
        AvatarFetcher, AvatarStore, Credentials, FacebookVerifier, GoogleVerifier,
        MoodleProvider, NativeProvider, ProviderChain, SocialProfile, SocialVerifier,
    },
    rules::{self, RoleSource, Rule, RuleContext, RuleSet},
    store::SessionStore,
    token::TokenService,
    user::{NewUser, Record, User},
};

/// Credential login input.
#[derive(Clone, Debug)]
pub struct LoginRequest {
    pub login_id: String,
    pub secret: SecretString,
    pub permanent: bool,
    pub captcha: ChallengeAnswer,
}

impl LoginRequest {
    #[must_use]
    pub fn new(login_id: &str, secret: SecretString) -> Self {
        Self {
            login_id: login_id.to_string(),
            secret,
            permanent: false,
            captcha: ChallengeAnswer::default(),
        }
    }

    #[must_use]
    pub const fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    #[must_use]
    pub fn with_captcha(mut self, captcha: ChallengeAnswer) -> Self {
        self.captcha = captcha;
        self
    }
}

/// Result of a login attempt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, ToSchema)]
pub struct SessionOutcome {
    pub ok: bool,
    pub user: Option<User>,
    pub token: String,
    pub error: ErrorMessage,
    pub captcha_required: bool,
    /// Which social resolution step failed to get a token: 0 existing link,
    /// 1 merged account, 2 new account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<u8>,
}

impl SessionOutcome {
    fn success(user: User, token: String) -> Self {
        Self {
            ok: true,
            user: Some(user),
            token,
            ..Self::default()
        }
    }

    fn failure(error: impl Into<ErrorMessage>, captcha_required: bool) -> Self {
        Self {
            error: error.into(),
            captcha_required,
            ..Self::default()
        }
    }

    fn bad_token(stage: u8) -> Self {
        Self {
            stage: Some(stage),
            ..Self::failure(ErrorCode::BadGeneratedToken, false)
        }
    }
}

/// Result of an access check.
#[derive(Clone, Debug, Default, PartialEq, Serialize, ToSchema)]
pub struct AccessOutcome {
    pub ok: bool,
    pub user: Option<User>,
    pub error: ErrorMessage,
}

impl AccessOutcome {
    fn granted(user: Option<User>) -> Self {
        Self {
            ok: true,
            user,
            error: ErrorMessage::default(),
        }
    }

    fn denied(error: impl Into<ErrorMessage>) -> Self {
        Self {
            ok: false,
            user: None,
            error: error.into(),
        }
    }
}

pub struct SessionManagerBuilder {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    avatar_store: Option<Arc<dyn AvatarStore>>,
    social: HashMap<String, Arc<dyn SocialVerifier>>,
    client: Option<reqwest::Client>,
}

impl SessionManagerBuilder {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_avatar_store(mut self, store: Arc<dyn AvatarStore>) -> Self {
        self.avatar_store = Some(store);
        self
    }

    /// Replace the verifier used for `origin`.
    #[must_use]
    pub fn with_social_verifier(mut self, origin: &str, verifier: Arc<dyn SocialVerifier>) -> Self {
        self.social.insert(origin.to_string(), verifier);
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .user_agent(crate::APP_USER_AGENT)
                .timeout(config.external_timeout())
                .build()
                .context("failed to build HTTP client")?,
        };

        let ledger = Arc::new(AttemptLedger::new(
            config.clone(),
            self.store.clone(),
            self.clock.clone(),
        ));
        let tokens = TokenService::new(config.clone(), self.store.clone(), self.clock.clone());
        let challenges = ChallengeManager::new(
            config.clone(),
            self.store.clone(),
            self.clock.clone(),
            ledger.clone(),
            RecaptchaVerifier::new(client.clone(), config.recaptcha_verify_url()),
        );
        let avatars = AvatarFetcher::new(client.clone(), self.avatar_store);

        let native = Arc::new(NativeProvider::new(self.store.clone(), ledger.clone()));
        let moodle = Arc::new(MoodleProvider::new(
            config.clone(),
            client.clone(),
            self.store.clone(),
            ledger.clone(),
            avatars.clone(),
        ));
        let chain = ProviderChain::new(native).with_federated(moodle);

        let mut social = HashMap::new();
        if config.social_enabled() {
            social.insert(
                config.google_origin().to_string(),
                Arc::new(GoogleVerifier::new(
                    client.clone(),
                    config.google_discovery_url(),
                    config.google_tokeninfo_url(),
                    config.google_client_id().map(ToString::to_string),
                )) as Arc<dyn SocialVerifier>,
            );
            social.insert(
                config.facebook_origin().to_string(),
                Arc::new(FacebookVerifier::new(client, config.facebook_graph_url()))
                    as Arc<dyn SocialVerifier>,
            );
        }
        social.extend(self.social);

        Ok(SessionManager {
            groups: GroupManager::new(config.groups()),
            modify_permissions: Arc::new(config.modify_permissions().clone()),
            store: self.store,
            config,
            tokens,
            challenges,
            chain,
            social,
            avatars,
        })
    }
}

pub struct SessionManager {
    config: Arc<SessionConfig>,
    store: Arc<dyn SessionStore>,
    groups: GroupManager,
    modify_permissions: Arc<HashMap<String, Vec<String>>>,
    tokens: TokenService,
    challenges: ChallengeManager,
    chain: ProviderChain,
    social: HashMap<String, Arc<dyn SocialVerifier>>,
    avatars: AvatarFetcher,
}

impl SessionManager {
    #[must_use]
    pub fn builder(config: SessionConfig, store: Arc<dyn SessionStore>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            avatar_store: None,
            social: HashMap::new(),
            client: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn groups(&self) -> &GroupManager {
        &self.groups
    }

    /// Log in with credentials, honoring the brute-force guard.
    #[instrument(skip_all, fields(login_id = %request.login_id))]
    pub async fn start_session(
        &self,
        request: &LoginRequest,
        context: &RequestContext,
    ) -> SessionOutcome {
        let credentials = Credentials {
            login_id: request.login_id.clone(),
            secret: request.secret.clone(),
            metadata: context.metadata().clone(),
        };
        let (authenticated, user) = self.chain.authenticate(&credentials).await;

        match self.finish_login(authenticated, user, request, context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Failed to complete login: {err:#}");
                SessionOutcome::failure(self.internal_error(&err), false)
            }
        }
    }

    async fn finish_login(
        &self,
        authenticated: bool,
        user: Option<User>,
        request: &LoginRequest,
        context: &RequestContext,
    ) -> Result<SessionOutcome> {
        if !self
            .challenges
            .validate(user.as_ref(), &request.captcha, context)
            .await?
        {
            return Ok(SessionOutcome::failure(ErrorCode::InvalidCaptcha, true));
        }

        match user {
            Some(user) if authenticated => {
                let ttl = if request.permanent {
                    0
                } else {
                    self.config.expiration_hours()
                };
                let token = self.tokens.issue(&user, ttl, context.metadata()).await?;
                info!(user_id = user.id, "session started");
                Ok(SessionOutcome::success(user, token))
            }
            user => {
                let required = self.challenges.is_required(user.as_ref()).await?;
                Ok(SessionOutcome::failure(
                    ErrorCode::InvalidCredentials,
                    required,
                ))
            }
        }
    }

    /// Log in with a token from a social identity provider. Sessions started
    /// this way do not expire.
    #[instrument(skip(self, token, context))]
    pub async fn start_federated_session(
        &self,
        token: &str,
        origin: &str,
        context: &RequestContext,
    ) -> SessionOutcome {
        let Some(verifier) = self.social.get(origin) else {
            return SessionOutcome::failure(ErrorCode::InvalidToken, false);
        };
        let profile = match verifier.verify(token).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!("social token rejected: {err:#}");
                return SessionOutcome::failure(ErrorCode::InvalidToken, false);
            }
        };

        match self.resolve_social(&profile, origin, context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Failed to complete social login: {err:#}");
                SessionOutcome::failure(self.internal_error(&err), false)
            }
        }
    }

    async fn resolve_social(
        &self,
        profile: &SocialProfile,
        origin: &str,
        context: &RequestContext,
    ) -> Result<SessionOutcome> {
        if let Some(user) = self
            .store
            .find_user_by_social(&profile.external_id, origin)
            .await?
        {
            if !user.active {
                return Ok(SessionOutcome::failure(ErrorCode::InvalidCredentials, false));
            }
            return Ok(self.social_token(user, 0, context).await);
        }

        if let Some(user) = self.store.find_user_by_login_id(&profile.email).await? {
            if user.active {
                warn!(user_id = user.id, "social login matches an active account");
                return Ok(SessionOutcome::failure(ErrorCode::SuspendedUser, false));
            }
            let user = self
                .store
                .link_social(user.id, &profile.external_id, origin)
                .await?;
            info!(user_id = user.id, "social identity linked to existing account");
            return Ok(self.social_token(user, 1, context).await);
        }

        let avatar = if self.config.user_fields().avatar.is_some() {
            self.avatars.fetch(profile.avatar_url.as_deref()).await
        } else {
            None
        };
        let user = self
            .store
            .insert_user(NewUser {
                login_id: profile.email.clone(),
                role: self.config.provisioned_role().map(ToString::to_string),
                active: true,
                name: profile.name.clone(),
                avatar,
                social_id: Some(profile.external_id.clone()),
                social_origin: Some(origin.to_string()),
                ..NewUser::default()
            })
            .await?;
        info!(user_id = user.id, "provisioned user from social login");
        Ok(self.social_token(user, 2, context).await)
    }

    fn internal_error(&self, err: &anyhow::Error) -> ErrorMessage {
        let Some((message, description)) = self.config.internal_error_text() else {
            return ErrorCode::Internal.with_diagnostic(format!("{err:#}"));
        };
        let mut error = ErrorCode::Internal.with_custom(Some(message), Some(description));
        error.diagnostic = Some(format!("{err:#}"));
        error
    }

    async fn social_token(&self, user: User, stage: u8, context: &RequestContext) -> SessionOutcome {
        match self.tokens.issue(&user, 0, context.metadata()).await {
            Ok(token) => SessionOutcome::success(user, token),
            Err(err) => {
                error!(stage, "Failed to issue social session token: {err:#}");
                SessionOutcome::bad_token(stage)
            }
        }
    }

    /// Issue a classic challenge for `login_id` when one is required.
    #[instrument(skip(self))]
    pub async fn generate_challenge(&self, login_id: &str) -> Option<String> {
        let result = async {
            let user = self.store.find_user_by_login_id(login_id).await?;
            self.challenges.generate(user.as_ref()).await
        }
        .await;
        result.unwrap_or_else(|err| {
            error!("Failed to generate captcha: {err:#}");
            None
        })
    }

    /// PNG for a challenge, once. `None` for unknown, expired or already
    /// rendered challenges.
    #[instrument(skip(self))]
    pub async fn render_challenge(&self, challenge_id: &str) -> Option<Vec<u8>> {
        self.challenges
            .render(challenge_id)
            .await
            .unwrap_or_else(|err| {
                error!("Failed to render captcha: {err:#}");
                None
            })
    }

    /// Resolve the bearer token on `context` without any group check.
    pub async fn resolve_bearer(&self, context: &RequestContext) -> AuthInfo {
        let Some(token) = context.bearer() else {
            return AuthInfo::invalid(ErrorCode::InvalidToken.to_message());
        };
        match self.tokens.verify(token).await {
            Ok(user) => AuthInfo::valid(user),
            Err(error) => AuthInfo::invalid(error),
        }
    }

    /// Check that the caller may use an operation guarded by `group`.
    /// `open` and `None` admit everyone without looking at the token.
    #[instrument(skip(self, context))]
    pub async fn validate_access(
        &self,
        context: &RequestContext,
        group: Option<&str>,
    ) -> AccessOutcome {
        let group = match group {
            None | Some(GROUP_OPEN) => return AccessOutcome::granted(None),
            Some(group) => group,
        };

        let info = match context.auth_info() {
            Some(info) => info.clone(),
            None => self.resolve_bearer(context).await,
        };
        match info.user {
            Some(user) if info.valid => {
                if self.groups.allows(&user, group) {
                    AccessOutcome::granted(Some(user))
                } else {
                    AccessOutcome::denied(ErrorCode::AccessDenied)
                }
            }
            _ => AccessOutcome::denied(info.error),
        }
    }

    /// Revoke the caller's token.
    #[instrument(skip_all)]
    pub async fn end_session(&self, context: &RequestContext) -> AccessOutcome {
        let access = self.validate_access(context, Some(GROUP_ALL)).await;
        if !access.ok {
            return access;
        }
        let Some(token) = context.bearer() else {
            return AccessOutcome::denied(ErrorCode::InvalidToken);
        };
        match self.tokens.revoke(token).await {
            Ok(_) => access,
            Err(err) => {
                error!("Failed to revoke token: {err:#}");
                AccessOutcome::denied(self.internal_error(&err))
            }
        }
    }

    /// Evaluate `rules` for the current user against `target` and `args`.
    pub async fn authorize(
        &self,
        context: &RequestContext,
        rules: &RuleSet,
        target: Option<&dyn Record>,
        args: &Map<String, Value>,
    ) -> AccessOutcome {
        let access = self.validate_access(context, Some(GROUP_ALL)).await;
        if !access.ok {
            return access;
        }
        let allowed = rules.evaluate(&RuleContext {
            user: access.user.as_ref(),
            target,
            args,
        });
        if allowed {
            access
        } else {
            AccessOutcome::denied(ErrorCode::InsufficientPermissions)
        }
    }

    /// Rule backed by the configured role modification table.
    #[must_use]
    pub fn can_modify_role(&self, source: RoleSource) -> Rule {
        rules::can_modify_role(self.modify_permissions.clone(), source)
    }
}
