//! Session configuration, built once and shared behind an `Arc`.

use regex::Regex;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::session::context::RequestContext;

const DEFAULT_EXPIRATION_HOURS: i64 = 12;
const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 1;
const DEFAULT_MAX_CAPTCHA_BY_USER: u32 = 6;
const DEFAULT_CAPTCHA_EXPIRATION_MINUTES: i64 = 1;
const DEFAULT_CAPTCHA_LENGTH: usize = 6;
const DEFAULT_EXTERNAL_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_MOODLE_AUTH_FIELD: &str = "username";
const DEFAULT_MOODLE_ID_FIELD: &str = "email";
pub const DEFAULT_GOOGLE_ORIGIN: &str = "GOOGLE";
pub const DEFAULT_FACEBOOK_ORIGIN: &str = "FACEBOOK";
pub const DEFAULT_GOOGLE_DISCOVERY_URL: &str =
    "https://accounts.google.com/.well-known/openid-configuration";
pub const DEFAULT_GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
pub const DEFAULT_FACEBOOK_GRAPH_URL: &str = "https://graph.facebook.com/v3.1";
pub const DEFAULT_RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid identifier for {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("reCAPTCHA style requires a secret key")]
    MissingRecaptchaSecret,
    #[error("reCAPTCHA style requires a site key")]
    MissingRecaptchaSiteKey,
    #[error("social login requires the social id and social origin user fields")]
    MissingSocialFields,
    #[error("captcha length must be greater than zero")]
    InvalidCaptchaLength,
    #[error("session expiration must not be negative")]
    NegativeExpiration,
    #[error("unknown captcha style: {0}")]
    UnknownCaptchaStyle(String),
}

/// A value fixed at configuration time or computed per call.
pub enum Configurable<T, C = ()> {
    Static(T),
    Derived(Arc<dyn Fn(&C) -> T + Send + Sync>),
}

impl<T: Clone, C> Configurable<T, C> {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&C) -> T + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    pub fn resolve(&self, context: &C) -> T {
        match self {
            Self::Static(value) => value.clone(),
            Self::Derived(f) => f(context),
        }
    }

    pub const fn as_static(&self) -> Option<&T> {
        match self {
            Self::Static(value) => Some(value),
            Self::Derived(_) => None,
        }
    }
}

impl<T: Clone, C> Clone for Configurable<T, C> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(value) => Self::Static(value.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug, C> fmt::Debug for Configurable<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Input handed to a derived signing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyContext {
    Issue { user_id: i64, login_id: String },
    Verify { token: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptchaStyle {
    #[default]
    Classic,
    Recaptcha,
}

impl CaptchaStyle {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Recaptcha => "google_recaptcha_v3",
        }
    }
}

impl FromStr for CaptchaStyle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(Self::Classic),
            "google_recaptcha_v3" | "recaptcha" => Ok(Self::Recaptcha),
            other => Err(ConfigError::UnknownCaptchaStyle(other.to_string())),
        }
    }
}

/// An LMS instance: base URL plus the web service token used for profile lookups.
#[derive(Clone, Debug)]
pub struct FederatedEndpoint {
    pub url: String,
    pub token: SecretString,
}

impl FederatedEndpoint {
    #[must_use]
    pub fn new(url: &str, token: SecretString) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

/// Table and column names for the host application's user records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserFields {
    pub table: String,
    pub id: String,
    pub login_id: String,
    pub password: String,
    pub role: String,
    pub active: Option<String>,
    pub name: String,
    pub avatar: Option<String>,
    pub social_id: Option<String>,
    pub social_origin: Option<String>,
}

impl Default for UserFields {
    fn default() -> Self {
        Self {
            table: "users".to_string(),
            id: "id".to_string(),
            login_id: "email".to_string(),
            password: "password".to_string(),
            role: "role".to_string(),
            active: Some("is_active".to_string()),
            name: "name".to_string(),
            avatar: Some("photo".to_string()),
            social_id: Some("social_id".to_string()),
            social_origin: Some("social_origin".to_string()),
        }
    }
}

fn valid_identifier(value: &str) -> bool {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").is_ok_and(|re| re.is_match(value))
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if valid_identifier(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

impl UserFields {
    /// Names end up in SQL text, so each must be a plain identifier. The table
    /// may be schema-qualified.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidIdentifier`] for the first offending name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for part in self.table.split('.') {
            check_identifier("table", part)?;
        }
        check_identifier("id", &self.id)?;
        check_identifier("login_id", &self.login_id)?;
        check_identifier("password", &self.password)?;
        check_identifier("role", &self.role)?;
        check_identifier("name", &self.name)?;
        let optional = [
            ("active", &self.active),
            ("avatar", &self.avatar),
            ("social_id", &self.social_id),
            ("social_origin", &self.social_origin),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                check_identifier(field, value)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    user_fields: UserFields,
    session_key: Option<String>,
    expiration_hours: i64,
    security_key: Configurable<SecretString, KeyContext>,
    persistent_tokens: bool,
    groups: HashMap<String, Vec<String>>,
    modify_permissions: HashMap<String, Vec<String>>,
    provisioned_role: Option<String>,
    federated_endpoints: Configurable<Vec<FederatedEndpoint>>,
    moodle_auth_field: String,
    moodle_id_field: String,
    social_enabled: bool,
    google_origin: String,
    facebook_origin: String,
    google_client_id: Option<String>,
    google_discovery_url: String,
    google_tokeninfo_url: String,
    facebook_graph_url: String,
    captcha_enabled: bool,
    captcha_style: Configurable<CaptchaStyle, RequestContext>,
    recaptcha_secret: Option<Configurable<SecretString>>,
    recaptcha_site_key: Option<String>,
    recaptcha_verify_url: String,
    max_login_attempts: u32,
    max_captcha_by_user: u32,
    captcha_expiration_minutes: i64,
    captcha_length: usize,
    retain_failed_secrets: bool,
    external_timeout: Duration,
    internal_error_text: Option<(String, String)>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(security_key: SecretString) -> Self {
        Self {
            user_fields: UserFields::default(),
            session_key: None,
            expiration_hours: DEFAULT_EXPIRATION_HOURS,
            security_key: Configurable::Static(security_key),
            persistent_tokens: false,
            groups: HashMap::new(),
            modify_permissions: HashMap::new(),
            provisioned_role: None,
            federated_endpoints: Configurable::Static(Vec::new()),
            moodle_auth_field: DEFAULT_MOODLE_AUTH_FIELD.to_string(),
            moodle_id_field: DEFAULT_MOODLE_ID_FIELD.to_string(),
            social_enabled: false,
            google_origin: DEFAULT_GOOGLE_ORIGIN.to_string(),
            facebook_origin: DEFAULT_FACEBOOK_ORIGIN.to_string(),
            google_client_id: None,
            google_discovery_url: DEFAULT_GOOGLE_DISCOVERY_URL.to_string(),
            google_tokeninfo_url: DEFAULT_GOOGLE_TOKENINFO_URL.to_string(),
            facebook_graph_url: DEFAULT_FACEBOOK_GRAPH_URL.to_string(),
            captcha_enabled: false,
            captcha_style: Configurable::Static(CaptchaStyle::Classic),
            recaptcha_secret: None,
            recaptcha_site_key: None,
            recaptcha_verify_url: DEFAULT_RECAPTCHA_VERIFY_URL.to_string(),
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            max_captcha_by_user: DEFAULT_MAX_CAPTCHA_BY_USER,
            captcha_expiration_minutes: DEFAULT_CAPTCHA_EXPIRATION_MINUTES,
            captcha_length: DEFAULT_CAPTCHA_LENGTH,
            retain_failed_secrets: false,
            external_timeout: Duration::from_secs(DEFAULT_EXTERNAL_TIMEOUT_SECONDS),
            internal_error_text: None,
        }
    }

    /// # Errors
    /// Returns a [`ConfigError`] when options contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.user_fields.validate()?;
        if self.expiration_hours < 0 {
            return Err(ConfigError::NegativeExpiration);
        }
        if self.captcha_length == 0 {
            return Err(ConfigError::InvalidCaptchaLength);
        }
        if self.captcha_enabled
            && self.captcha_style.as_static() == Some(&CaptchaStyle::Recaptcha)
            && self.recaptcha_secret.is_none()
        {
            return Err(ConfigError::MissingRecaptchaSecret);
        }
        // A derived style may pick reCAPTCHA per request once a secret is set.
        let may_use_recaptcha = match self.captcha_style.as_static() {
            Some(style) => *style == CaptchaStyle::Recaptcha,
            None => self.recaptcha_secret.is_some(),
        };
        if self.captcha_enabled && may_use_recaptcha && self.recaptcha_site_key.is_none() {
            return Err(ConfigError::MissingRecaptchaSiteKey);
        }
        if self.social_enabled
            && (self.user_fields.social_id.is_none() || self.user_fields.social_origin.is_none())
        {
            return Err(ConfigError::MissingSocialFields);
        }
        Ok(())
    }

    #[must_use]
    pub fn with_user_fields(mut self, fields: UserFields) -> Self {
        self.user_fields = fields;
        self
    }

    #[must_use]
    pub fn with_session_key(mut self, session_key: Option<String>) -> Self {
        self.session_key = session_key;
        self
    }

    #[must_use]
    pub fn with_expiration_hours(mut self, hours: i64) -> Self {
        self.expiration_hours = hours;
        self
    }

    #[must_use]
    pub fn with_security_key(mut self, key: Configurable<SecretString, KeyContext>) -> Self {
        self.security_key = key;
        self
    }

    #[must_use]
    pub fn with_persistent_tokens(mut self, enabled: bool) -> Self {
        self.persistent_tokens = enabled;
        self
    }

    #[must_use]
    pub fn with_group(mut self, name: &str, roles: &[&str]) -> Self {
        self.groups.insert(
            name.to_string(),
            roles.iter().map(ToString::to_string).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: HashMap<String, Vec<String>>) -> Self {
        self.groups = groups;
        self
    }

    /// Roles that `role` may assign or modify.
    #[must_use]
    pub fn with_modify_permission(mut self, role: &str, permitted: &[&str]) -> Self {
        self.modify_permissions.insert(
            role.to_string(),
            permitted.iter().map(ToString::to_string).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_provisioned_role(mut self, role: Option<String>) -> Self {
        self.provisioned_role = role;
        self
    }

    #[must_use]
    pub fn with_federated_endpoints(mut self, endpoints: Configurable<Vec<FederatedEndpoint>>) -> Self {
        self.federated_endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn with_moodle_fields(mut self, auth_field: &str, id_field: &str) -> Self {
        self.moodle_auth_field = auth_field.to_string();
        self.moodle_id_field = id_field.to_string();
        self
    }

    #[must_use]
    pub fn with_social(mut self, enabled: bool) -> Self {
        self.social_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_social_origins(mut self, google: &str, facebook: &str) -> Self {
        self.google_origin = google.to_string();
        self.facebook_origin = facebook.to_string();
        self
    }

    #[must_use]
    pub fn with_google_client_id(mut self, client_id: Option<String>) -> Self {
        self.google_client_id = client_id;
        self
    }

    #[must_use]
    pub fn with_google_urls(mut self, discovery_url: &str, tokeninfo_url: &str) -> Self {
        self.google_discovery_url = discovery_url.to_string();
        self.google_tokeninfo_url = tokeninfo_url.to_string();
        self
    }

    #[must_use]
    pub fn with_facebook_graph_url(mut self, url: &str) -> Self {
        self.facebook_graph_url = url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_captcha(mut self, enabled: bool) -> Self {
        self.captcha_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_captcha_style(mut self, style: Configurable<CaptchaStyle, RequestContext>) -> Self {
        self.captcha_style = style;
        self
    }

    #[must_use]
    pub fn with_recaptcha(
        mut self,
        secret: Configurable<SecretString>,
        site_key: Option<String>,
    ) -> Self {
        self.recaptcha_secret = Some(secret);
        self.recaptcha_site_key = site_key;
        self
    }

    #[must_use]
    pub fn with_recaptcha_verify_url(mut self, url: &str) -> Self {
        self.recaptcha_verify_url = url.to_string();
        self
    }

    /// Message and description reported for internal faults instead of the
    /// catalog text. The fault itself stays in the diagnostic.
    #[must_use]
    pub fn with_internal_error_text(mut self, message: &str, description: &str) -> Self {
        self.internal_error_text = Some((message.to_string(), description.to_string()));
        self
    }

    #[must_use]
    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_max_captcha_by_user(mut self, captchas: u32) -> Self {
        self.max_captcha_by_user = captchas;
        self
    }

    #[must_use]
    pub fn with_captcha_expiration_minutes(mut self, minutes: i64) -> Self {
        self.captcha_expiration_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_captcha_length(mut self, length: usize) -> Self {
        self.captcha_length = length;
        self
    }

    #[must_use]
    pub fn with_retain_failed_secrets(mut self, retain: bool) -> Self {
        self.retain_failed_secrets = retain;
        self
    }

    #[must_use]
    pub fn with_external_timeout(mut self, timeout: Duration) -> Self {
        self.external_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn user_fields(&self) -> &UserFields {
        &self.user_fields
    }

    #[must_use]
    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    #[must_use]
    pub const fn expiration_hours(&self) -> i64 {
        self.expiration_hours
    }

    #[must_use]
    pub const fn security_key(&self) -> &Configurable<SecretString, KeyContext> {
        &self.security_key
    }

    #[must_use]
    pub const fn persistent_tokens(&self) -> bool {
        self.persistent_tokens
    }

    #[must_use]
    pub const fn groups(&self) -> &HashMap<String, Vec<String>> {
        &self.groups
    }

    #[must_use]
    pub const fn modify_permissions(&self) -> &HashMap<String, Vec<String>> {
        &self.modify_permissions
    }

    #[must_use]
    pub fn provisioned_role(&self) -> Option<&str> {
        self.provisioned_role.as_deref()
    }

    #[must_use]
    pub fn federated_endpoints(&self) -> Vec<FederatedEndpoint> {
        self.federated_endpoints.resolve(&())
    }

    #[must_use]
    pub fn moodle_auth_field(&self) -> &str {
        &self.moodle_auth_field
    }

    #[must_use]
    pub fn moodle_id_field(&self) -> &str {
        &self.moodle_id_field
    }

    #[must_use]
    pub const fn social_enabled(&self) -> bool {
        self.social_enabled
    }

    #[must_use]
    pub fn google_origin(&self) -> &str {
        &self.google_origin
    }

    #[must_use]
    pub fn facebook_origin(&self) -> &str {
        &self.facebook_origin
    }

    #[must_use]
    pub fn google_client_id(&self) -> Option<&str> {
        self.google_client_id.as_deref()
    }

    #[must_use]
    pub fn google_discovery_url(&self) -> &str {
        &self.google_discovery_url
    }

    #[must_use]
    pub fn google_tokeninfo_url(&self) -> &str {
        &self.google_tokeninfo_url
    }

    #[must_use]
    pub fn facebook_graph_url(&self) -> &str {
        &self.facebook_graph_url
    }

    #[must_use]
    pub const fn captcha_enabled(&self) -> bool {
        self.captcha_enabled
    }

    #[must_use]
    pub fn captcha_style(&self, context: &RequestContext) -> CaptchaStyle {
        self.captcha_style.resolve(context)
    }

    #[must_use]
    pub fn recaptcha_secret(&self) -> Option<SecretString> {
        self.recaptcha_secret.as_ref().map(|secret| secret.resolve(&()))
    }

    #[must_use]
    pub fn recaptcha_site_key(&self) -> Option<&str> {
        self.recaptcha_site_key.as_deref()
    }

    #[must_use]
    pub fn internal_error_text(&self) -> Option<(&str, &str)> {
        self.internal_error_text
            .as_ref()
            .map(|(message, description)| (message.as_str(), description.as_str()))
    }

    #[must_use]
    pub fn recaptcha_verify_url(&self) -> &str {
        &self.recaptcha_verify_url
    }

    #[must_use]
    pub const fn max_login_attempts(&self) -> u32 {
        self.max_login_attempts
    }

    #[must_use]
    pub const fn max_captcha_by_user(&self) -> u32 {
        self.max_captcha_by_user
    }

    #[must_use]
    pub const fn captcha_expiration_minutes(&self) -> i64 {
        self.captcha_expiration_minutes
    }

    #[must_use]
    pub const fn captcha_length(&self) -> usize {
        self.captcha_length
    }

    #[must_use]
    pub const fn retain_failed_secrets(&self) -> bool {
        self.retain_failed_secrets
    }

    #[must_use]
    pub const fn external_timeout(&self) -> Duration {
        self.external_timeout
    }
}
