use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use crate::session::config::FederatedEndpoint;

pub const ARG_MOODLE_ENDPOINT: &str = "moodle-endpoint";
pub const ARG_MOODLE_AUTH_FIELD: &str = "moodle-auth-field";
pub const ARG_MOODLE_ID_FIELD: &str = "moodle-id-field";
pub const ARG_SOCIAL: &str = "social";
pub const ARG_GOOGLE_CLIENT_ID: &str = "google-client-id";
pub const ARG_EXTERNAL_TIMEOUT_SECONDS: &str = "external-timeout-seconds";

#[derive(Debug)]
pub struct Options {
    pub endpoints: Vec<FederatedEndpoint>,
    pub moodle_auth_field: String,
    pub moodle_id_field: String,
    pub social: bool,
    pub google_client_id: Option<String>,
    pub external_timeout_seconds: u64,
}

/// Split `URL=TOKEN` on the last `=`, so query strings in the URL survive.
///
/// # Errors
/// Returns an error when the value has no token part.
pub fn parse_endpoint(value: &str) -> anyhow::Result<FederatedEndpoint> {
    match value.rsplit_once('=') {
        Some((url, token)) if !url.trim().is_empty() && !token.trim().is_empty() => Ok(
            FederatedEndpoint::new(url.trim(), SecretString::from(token.trim().to_string())),
        ),
        _ => anyhow::bail!("invalid --{ARG_MOODLE_ENDPOINT} value, expected URL=TOKEN"),
    }
}

impl Options {
    /// Parse identity federation arguments from matches.
    ///
    /// # Errors
    /// Returns an error if an endpoint is malformed.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let endpoints = matches
            .get_many::<String>(ARG_MOODLE_ENDPOINT)
            .unwrap_or_default()
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_endpoint(v))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let get_or = |id: &str, default: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            endpoints,
            moodle_auth_field: get_or(ARG_MOODLE_AUTH_FIELD, "username"),
            moodle_id_field: get_or(ARG_MOODLE_ID_FIELD, "email"),
            social: matches.get_flag(ARG_SOCIAL),
            google_client_id: matches
                .get_one::<String>(ARG_GOOGLE_CLIENT_ID)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            external_timeout_seconds: matches
                .get_one::<u64>(ARG_EXTERNAL_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(10),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MOODLE_ENDPOINT)
                .long(ARG_MOODLE_ENDPOINT)
                .help("Moodle site and web service token as URL=TOKEN (repeatable, tried in order)")
                .env("TESSERA_MOODLE_ENDPOINTS")
                .hide_env_values(true)
                .value_delimiter(';')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_MOODLE_AUTH_FIELD)
                .long(ARG_MOODLE_AUTH_FIELD)
                .help("Moodle profile field the login id is matched against")
                .env("TESSERA_MOODLE_AUTH_FIELD")
                .default_value("username"),
        )
        .arg(
            Arg::new(ARG_MOODLE_ID_FIELD)
                .long(ARG_MOODLE_ID_FIELD)
                .help("Moodle profile field mapped to the local login id")
                .env("TESSERA_MOODLE_ID_FIELD")
                .default_value("email"),
        )
        .arg(
            Arg::new(ARG_SOCIAL)
                .long(ARG_SOCIAL)
                .help("Accept Google and Facebook access tokens")
                .env("TESSERA_SOCIAL")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_GOOGLE_CLIENT_ID)
                .long(ARG_GOOGLE_CLIENT_ID)
                .help("Expected audience when Google ID tokens are checked")
                .env("TESSERA_GOOGLE_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_EXTERNAL_TIMEOUT_SECONDS)
                .long(ARG_EXTERNAL_TIMEOUT_SECONDS)
                .help("Timeout for calls to identity providers and reCAPTCHA")
                .env("TESSERA_EXTERNAL_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
}
