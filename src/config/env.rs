//! Environment variable access. Every variable carries the `PARLI_` prefix.

use std::env;
use std::fmt::Display;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "PARLI_";

fn var_name(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

/// Trimmed value of `PARLI_{name}`; empty values count as unset.
pub(super) fn env_string(name: &str) -> Option<String> {
    env::var(var_name(name))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(super) fn env_parse<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    env_string(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| format!("Invalid value for {}: {e}", var_name(name)))
        })
        .transpose()
}

pub(super) fn env_bool(name: &str) -> Result<Option<bool>, String> {
    env_string(name)
        .map(|raw| match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(format!(
                "Invalid boolean for {}: '{raw}'",
                var_name(name)
            )),
        })
        .transpose()
}

/// Comma-separated list; blank entries are dropped.
pub(super) fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
