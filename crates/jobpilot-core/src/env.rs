//! Helpers for reading optional `JOBPILOT_*` settings.
//!
//! Config structs implement `from_lookup` over any `Fn(&str) -> Option<String>`
//! so tests never touch the process environment; `from_env` passes
//! [`process_env`].

use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Parse an optional variable. Unset or blank means `None`.
pub fn parse_var<T, L>(lookup: &L, name: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| AppError::ConfigError(format!("Invalid {name} '{raw}': {e}")))
}

/// Whole seconds, must be at least 1.
pub fn parse_secs<L>(lookup: &L, name: &str) -> Result<Option<Duration>, AppError>
where
    L: Fn(&str) -> Option<String>,
{
    match parse_var::<u64, L>(lookup, name)? {
        Some(0) => Err(AppError::ConfigError(format!(
            "{name} must be at least 1 second"
        ))),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
        None => Ok(None),
    }
}

/// `1/true/yes/on` or `0/false/no/off`, case-insensitive.
pub fn parse_flag<L>(lookup: &L, name: &str) -> Result<Option<bool>, AppError>
where
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(AppError::ConfigError(format!(
            "Invalid {name} '{other}': expected true or false"
        ))),
    }
}

/// Comma-separated list with blanks dropped.
pub fn parse_list<L>(lookup: &L, name: &str) -> Option<Vec<String>>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(name).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
