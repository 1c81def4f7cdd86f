use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;
use std::collections::HashMap;

pub const ARG_SECURITY_KEY: &str = "security-key";
pub const ARG_SESSION_KEY: &str = "session-key";
pub const ARG_EXPIRATION_HOURS: &str = "expiration-hours";
pub const ARG_PERSISTENT_TOKENS: &str = "persistent-tokens";
pub const ARG_GROUP: &str = "group";
pub const ARG_MODIFY_PERMISSION: &str = "modify-permission";
pub const ARG_PROVISIONED_ROLE: &str = "provisioned-role";
pub const ARG_USERS_TABLE: &str = "users-table";
pub const ARG_RETAIN_FAILED_SECRETS: &str = "retain-failed-secrets";
pub const ARG_APPLY_SCHEMA: &str = "apply-schema";
pub const ARG_AVATAR_DIR: &str = "avatar-dir";
pub const ARG_AVATAR_PREFIX: &str = "avatar-prefix";

#[derive(Debug)]
pub struct Options {
    pub security_key: SecretString,
    pub session_key: Option<String>,
    pub expiration_hours: i64,
    pub persistent_tokens: bool,
    pub groups: HashMap<String, Vec<String>>,
    pub modify_permissions: HashMap<String, Vec<String>>,
    pub provisioned_role: Option<String>,
    pub users_table: String,
    pub retain_failed_secrets: bool,
    pub apply_schema: bool,
    pub avatar_dir: Option<String>,
    pub avatar_prefix: String,
}

/// Parse `name=role1,role2` pairs into a role map. Repeated names merge.
///
/// # Errors
/// Returns an error when a pair has no `=` or an empty name.
pub fn parse_role_map<'a>(
    arg: &str,
    values: impl Iterator<Item = &'a String>,
) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for value in values {
        let Some((name, roles)) = value.split_once('=') else {
            bail!("invalid --{arg} value '{value}', expected name=role1,role2");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("invalid --{arg} value '{value}', name is empty");
        }
        let entry = map.entry(name.to_string()).or_default();
        entry.extend(
            roles
                .split(',')
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .map(ToString::to_string),
        );
    }
    Ok(map)
}

impl Options {
    /// Parse session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing key is missing or a role map is malformed.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let security_key = matches
            .get_one::<String>(ARG_SECURITY_KEY)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .context("missing required argument: --security-key")?;

        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let groups = parse_role_map(
            ARG_GROUP,
            matches.get_many::<String>(ARG_GROUP).unwrap_or_default(),
        )?;
        let modify_permissions = parse_role_map(
            ARG_MODIFY_PERMISSION,
            matches
                .get_many::<String>(ARG_MODIFY_PERMISSION)
                .unwrap_or_default(),
        )?;

        Ok(Self {
            security_key: SecretString::from(security_key),
            session_key: get_non_empty(ARG_SESSION_KEY),
            expiration_hours: matches
                .get_one::<i64>(ARG_EXPIRATION_HOURS)
                .copied()
                .unwrap_or(12),
            persistent_tokens: matches.get_flag(ARG_PERSISTENT_TOKENS),
            groups,
            modify_permissions,
            provisioned_role: get_non_empty(ARG_PROVISIONED_ROLE),
            users_table: get_non_empty(ARG_USERS_TABLE).unwrap_or_else(|| "users".to_string()),
            retain_failed_secrets: matches.get_flag(ARG_RETAIN_FAILED_SECRETS),
            apply_schema: matches.get_flag(ARG_APPLY_SCHEMA),
            avatar_dir: get_non_empty(ARG_AVATAR_DIR),
            avatar_prefix: get_non_empty(ARG_AVATAR_PREFIX)
                .unwrap_or_else(|| "avatars".to_string()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_access_args(command);
    with_storage_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SECURITY_KEY)
                .long(ARG_SECURITY_KEY)
                .help("HMAC key used to sign session tokens")
                .env("TESSERA_SECURITY_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_KEY)
                .long(ARG_SESSION_KEY)
                .help("Partition tag for tokens, attempts and challenges")
                .env("TESSERA_SESSION_KEY"),
        )
        .arg(
            Arg::new(ARG_EXPIRATION_HOURS)
                .long(ARG_EXPIRATION_HOURS)
                .help("Token lifetime in hours, 0 issues tokens without expiry")
                .env("TESSERA_EXPIRATION_HOURS")
                .default_value("12")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_PERSISTENT_TOKENS)
                .long(ARG_PERSISTENT_TOKENS)
                .help("Store issued tokens so logout can revoke them")
                .env("TESSERA_PERSISTENT_TOKENS")
                .action(ArgAction::SetTrue),
        )
}

fn with_access_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GROUP)
                .long(ARG_GROUP)
                .help("Access group as name=role1,role2 (repeatable)")
                .env("TESSERA_GROUPS")
                .value_delimiter(';')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_MODIFY_PERMISSION)
                .long(ARG_MODIFY_PERMISSION)
                .help("Roles a role may assign, as role=role1,role2 (repeatable)")
                .env("TESSERA_MODIFY_PERMISSIONS")
                .value_delimiter(';')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_PROVISIONED_ROLE)
                .long(ARG_PROVISIONED_ROLE)
                .help("Role given to accounts created from federated or social logins")
                .env("TESSERA_PROVISIONED_ROLE"),
        )
}

fn with_storage_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_USERS_TABLE)
                .long(ARG_USERS_TABLE)
                .help("Table holding user records")
                .env("TESSERA_USERS_TABLE")
                .default_value("users"),
        )
        .arg(
            Arg::new(ARG_RETAIN_FAILED_SECRETS)
                .long(ARG_RETAIN_FAILED_SECRETS)
                .help("Keep submitted secrets on failed attempt rows")
                .env("TESSERA_RETAIN_FAILED_SECRETS")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_APPLY_SCHEMA)
                .long(ARG_APPLY_SCHEMA)
                .help("Create missing tables on startup")
                .env("TESSERA_APPLY_SCHEMA")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_AVATAR_DIR)
                .long(ARG_AVATAR_DIR)
                .help("Directory where downloaded avatars are written")
                .env("TESSERA_AVATAR_DIR"),
        )
        .arg(
            Arg::new(ARG_AVATAR_PREFIX)
                .long(ARG_AVATAR_PREFIX)
                .help("Prefix stored in the avatar column for downloaded images")
                .env("TESSERA_AVATAR_PREFIX")
                .default_value("avatars"),
        )
}
