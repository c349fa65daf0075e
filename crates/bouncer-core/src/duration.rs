//! Parsing for the duration strings used throughout the bouncer
//! configuration and by the authority's `duration` field.
//!
//! The accepted grammar is a sequence of `<number><unit>` pairs, optionally
//! signed, e.g. `100ms`, `0.1s`, `1m30s`, `3h59m58.12s`, `-2s`. Units are
//! `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::BouncerError;

const UNITS: [(&str, f64); 7] = [
    ("ns", 1e-9),
    ("us", 1e-6),
    ("µs", 1e-6),
    ("ms", 1e-3),
    ("s", 1.0),
    ("m", 60.0),
    ("h", 3600.0),
];

/// Parses a duration into signed seconds.
pub fn parse_seconds(input: &str) -> Result<f64, BouncerError> {
    let invalid = || BouncerError::InvalidDuration(input.to_string());
    let trimmed = input.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest == "0" {
        return Ok(0.0);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let (_, scale) = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .ok_or_else(invalid)?;
        total += value * scale;
        rest = &rest[unit_len..];
    }

    Ok(if negative { -total } else { total })
}

/// Parses a non-negative duration.
pub fn parse_duration(input: &str) -> Result<Duration, BouncerError> {
    let seconds = parse_seconds(input)?;
    if seconds < 0.0 {
        return Err(BouncerError::InvalidDuration(input.to_string()));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| BouncerError::InvalidDuration(input.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// Serde adapter for configuration durations: either a duration string or a
/// bare integer number of seconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
