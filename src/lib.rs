//! # Tessera (session and authentication engine)
//!
//! `tessera` authenticates callers, issues and validates bearer tokens,
//! federates identity from external providers and gates repeated failures
//! behind a captcha.
//!
//! ## Login pipeline
//!
//! Credentials go through a fixed provider chain: Moodle web services first,
//! then the local user table (Argon2 hashed secrets). Social logins verify a
//! Google or Facebook access token and link, merge or provision the account.
//!
//! ## Brute-force guard
//!
//! Failed logins are recorded per partition (`session_key`). Once the failures
//! in the trailing hour reach the configured threshold, every login for that
//! user needs a solved challenge: a one-shot PNG rendered by the service, or a
//! reCAPTCHA token verified remotely.
//!
//! ## Access control
//!
//! Roles map to flat groups. Operations name a group; `open` admits anyone and
//! `all` admits any authenticated user. Finer checks are composed from the
//! rule builders in [`session::rules`].

pub mod cli;
pub mod session;
pub mod tessera;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
