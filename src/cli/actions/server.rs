use crate::cli::commands::{federation, guard, session};
use crate::session::{
    config::Configurable,
    providers::avatar::FsAvatarStore,
    store::postgres::PgStore,
    SessionConfig, SessionManager, UserFields,
};
use anyhow::Result;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub session: session::Options,
    pub guard: guard::Options,
    pub federation: federation::Options,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("dsn", &redacted_dsn(&self.dsn))
            .field("session", &self.session)
            .field("guard", &self.guard)
            .field("federation", &self.federation)
            .finish()
    }
}

impl Args {
    /// Assemble the engine configuration from parsed options.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let fields = UserFields {
            table: self.session.users_table.clone(),
            ..UserFields::default()
        };

        let mut config = SessionConfig::new(self.session.security_key.clone())
            .with_user_fields(fields)
            .with_session_key(self.session.session_key.clone())
            .with_expiration_hours(self.session.expiration_hours)
            .with_persistent_tokens(self.session.persistent_tokens)
            .with_groups(self.session.groups.clone())
            .with_provisioned_role(self.session.provisioned_role.clone())
            .with_retain_failed_secrets(self.session.retain_failed_secrets)
            .with_captcha(self.guard.captcha)
            .with_captcha_style(Configurable::Static(self.guard.style))
            .with_max_login_attempts(self.guard.max_login_attempts)
            .with_max_captcha_by_user(self.guard.max_captcha_by_user)
            .with_captcha_expiration_minutes(self.guard.captcha_expiration_minutes)
            .with_captcha_length(self.guard.captcha_length)
            .with_federated_endpoints(Configurable::Static(self.federation.endpoints.clone()))
            .with_moodle_fields(
                &self.federation.moodle_auth_field,
                &self.federation.moodle_id_field,
            )
            .with_social(self.federation.social)
            .with_google_client_id(self.federation.google_client_id.clone())
            .with_external_timeout(Duration::from_secs(self.federation.external_timeout_seconds));

        for (role, permitted) in &self.session.modify_permissions {
            let permitted: Vec<&str> = permitted.iter().map(String::as_str).collect();
            config = config.with_modify_permission(role, &permitted);
        }

        if let Some(secret) = &self.guard.recaptcha_secret {
            config = config.with_recaptcha(
                Configurable::Static(secret.clone()),
                self.guard.recaptcha_site_key.clone(),
            );
        }

        config
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid, the database is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let config = args.session_config();
    config.validate()?;

    let pool = PgStore::connect(&args.dsn).await?;
    let store = PgStore::new(pool, config.user_fields().clone())?;

    if args.session.apply_schema {
        store.apply_schema().await?;
        info!("Database schema applied");
    }

    let mut builder = SessionManager::builder(config, Arc::new(store));
    if let Some(dir) = &args.session.avatar_dir {
        builder = builder.with_avatar_store(Arc::new(FsAvatarStore::new(
            dir.as_str(),
            &args.session.avatar_prefix,
        )));
    }
    let manager = builder.build()?;

    crate::tessera::new(args.port, Arc::new(manager)).await
}

/// DSN with the password replaced, safe to log.
fn redacted_dsn(dsn: &str) -> String {
    let Ok(mut url) = Url::parse(dsn) else {
        return "<unparseable dsn>".to_string();
    };
    if url.password().is_none() {
        return url.to_string();
    }
    match url.set_password(Some("****")) {
        Ok(()) => url.to_string(),
        Err(()) => {
            warn!("DSN password could not be masked, not logging it");
            "<unredactable dsn>".to_string()
        }
    }
}

fn log_startup_args(args: &Args) {
    info!(
        port = args.port,
        dsn = %redacted_dsn(&args.dsn),
        session_key = args.session.session_key.as_deref().unwrap_or("-"),
        captcha = args.guard.captcha,
        captcha_style = args.guard.style.as_str(),
        moodle_endpoints = args.federation.endpoints.len(),
        social = args.federation.social,
        "Starting tessera"
    );
    debug!("Startup args: {:?}", args);
}
