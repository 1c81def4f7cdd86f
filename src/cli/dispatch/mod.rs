//! Maps validated CLI matches to the action the binary runs.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{federation, guard, session};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        session: session::Options::parse(matches)?,
        guard: guard::Options::parse(matches)?,
        federation: federation::Options::parse(matches)?,
    }))
}
