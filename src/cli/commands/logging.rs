//! Log verbosity and output format.

use clap::{builder::PossibleValuesParser, builder::ValueParser, Arg, ArgAction, ArgMatches, Command};
use std::str::FromStr;
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";

/// Indexed by `-v` count; the last entry also covers higher counts.
const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human oriented.
    #[default]
    Pretty,
    /// One JSON object per event, fields flattened.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Options {
    pub level: Level,
    pub format: LogFormat,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let verbosity = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
        let format = matches
            .get_one::<String>(ARG_LOG_FORMAT)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();
        Self {
            level: level_for(verbosity),
            format,
        }
    }
}

#[must_use]
pub fn level_for(verbosity: u8) -> Level {
    LEVELS
        .get(usize::from(verbosity))
        .copied()
        .unwrap_or(Level::TRACE)
}

/// Accepts a count (`0`..=`4`) or a level name such as `debug`.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if usize::from(parsed) < LEVELS.len() {
                return Ok(parsed);
            }
        }
        LEVELS
            .iter()
            .position(|candidate| candidate.as_str().eq_ignore_ascii_case(level.trim()))
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| format!("invalid log level: {level}"))
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("TESSERA_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long(ARG_LOG_FORMAT)
                .help("Log output format")
                .env("TESSERA_LOG_FORMAT")
                .global(true)
                .default_value("pretty")
                .value_parser(PossibleValuesParser::new(["pretty", "json"])),
        )
}
