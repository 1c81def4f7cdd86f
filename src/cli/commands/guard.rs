use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use crate::session::config::CaptchaStyle;

pub const ARG_CAPTCHA: &str = "captcha";
pub const ARG_CAPTCHA_STYLE: &str = "captcha-style";
pub const ARG_RECAPTCHA_SECRET: &str = "recaptcha-secret";
pub const ARG_RECAPTCHA_SITE_KEY: &str = "recaptcha-site-key";
pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_MAX_CAPTCHA_BY_USER: &str = "max-captcha-by-user";
pub const ARG_CAPTCHA_EXPIRATION_MINUTES: &str = "captcha-expiration-minutes";
pub const ARG_CAPTCHA_LENGTH: &str = "captcha-length";

#[derive(Debug)]
pub struct Options {
    pub captcha: bool,
    pub style: CaptchaStyle,
    pub recaptcha_secret: Option<SecretString>,
    pub recaptcha_site_key: Option<String>,
    pub max_login_attempts: u32,
    pub max_captcha_by_user: u32,
    pub captcha_expiration_minutes: i64,
    pub captcha_length: usize,
}

impl Options {
    /// Parse brute-force guard arguments from matches.
    ///
    /// # Errors
    /// Returns an error for an unknown captcha style, or when reCAPTCHA is
    /// selected without a secret or a site key.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let style = get_non_empty(ARG_CAPTCHA_STYLE)
            .map(|value| value.parse::<CaptchaStyle>())
            .transpose()
            .context("invalid --captcha-style")?
            .unwrap_or_default();

        let recaptcha_secret = get_non_empty(ARG_RECAPTCHA_SECRET).map(SecretString::from);
        let recaptcha_site_key = get_non_empty(ARG_RECAPTCHA_SITE_KEY);
        let captcha = matches.get_flag(ARG_CAPTCHA);
        if captcha && style == CaptchaStyle::Recaptcha {
            if recaptcha_secret.is_none() {
                anyhow::bail!("missing required argument: --{ARG_RECAPTCHA_SECRET}");
            }
            if recaptcha_site_key.is_none() {
                anyhow::bail!("missing required argument: --{ARG_RECAPTCHA_SITE_KEY}");
            }
        }

        Ok(Self {
            captcha,
            style,
            recaptcha_secret,
            recaptcha_site_key,
            max_login_attempts: matches
                .get_one::<u32>(ARG_MAX_LOGIN_ATTEMPTS)
                .copied()
                .unwrap_or(1),
            max_captcha_by_user: matches
                .get_one::<u32>(ARG_MAX_CAPTCHA_BY_USER)
                .copied()
                .unwrap_or(6),
            captcha_expiration_minutes: matches
                .get_one::<i64>(ARG_CAPTCHA_EXPIRATION_MINUTES)
                .copied()
                .unwrap_or(1),
            captcha_length: matches
                .get_one::<usize>(ARG_CAPTCHA_LENGTH)
                .copied()
                .unwrap_or(6),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CAPTCHA)
                .long(ARG_CAPTCHA)
                .help("Require a solved challenge after repeated failed logins")
                .env("TESSERA_CAPTCHA")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_CAPTCHA_STYLE)
                .long(ARG_CAPTCHA_STYLE)
                .help("Challenge style: classic or google_recaptcha_v3")
                .env("TESSERA_CAPTCHA_STYLE")
                .default_value("classic"),
        )
        .arg(
            Arg::new(ARG_RECAPTCHA_SECRET)
                .long(ARG_RECAPTCHA_SECRET)
                .help("reCAPTCHA server secret")
                .env("TESSERA_RECAPTCHA_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_RECAPTCHA_SITE_KEY)
                .long(ARG_RECAPTCHA_SITE_KEY)
                .help("reCAPTCHA site key handed to clients")
                .env("TESSERA_RECAPTCHA_SITE_KEY"),
        )
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Failed logins within an hour before a challenge is required")
                .env("TESSERA_MAX_LOGIN_ATTEMPTS")
                .default_value("1")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_MAX_CAPTCHA_BY_USER)
                .long(ARG_MAX_CAPTCHA_BY_USER)
                .help("Live challenges allowed per user")
                .env("TESSERA_MAX_CAPTCHA_BY_USER")
                .default_value("6")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_CAPTCHA_EXPIRATION_MINUTES)
                .long(ARG_CAPTCHA_EXPIRATION_MINUTES)
                .help("Challenge lifetime in minutes")
                .env("TESSERA_CAPTCHA_EXPIRATION_MINUTES")
                .default_value("1")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CAPTCHA_LENGTH)
                .long(ARG_CAPTCHA_LENGTH)
                .help("Characters in a classic challenge")
                .env("TESSERA_CAPTCHA_LENGTH")
                .default_value("6")
                .value_parser(clap::value_parser!(usize)),
        )
}
