//! Idle time-to-live values
//!
//! TTLs are written the way Kubernetes users expect durations: `30m`,
//! `1h30m`, `24h`, `90s`, `500ms`. A TTL of `0` exempts the agent from
//! idle scale-down altogether.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// TTL used when a record does not specify one
pub const DEFAULT_TTL: &str = "24h";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TtlError {
    #[error("Empty duration")]
    Empty,

    #[error("Invalid duration {0:?}")]
    Invalid(String),

    #[error("Unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },

    #[error("Duration {0:?} is out of range")]
    Overflow(String),
}

/// Idle TTL policy for one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IdleTtl {
    /// Never scale down for idleness
    Disabled,
    /// Scale down after this much inactivity
    After(Duration),
}

impl IdleTtl {
    /// Parse a TTL; `0` (with or without a unit) is the disabling sentinel
    pub fn parse(raw: &str) -> Result<Self, TtlError> {
        let trimmed = raw.trim();
        if trimmed == "0" {
            return Ok(IdleTtl::Disabled);
        }
        let duration = parse_duration(trimmed)?;
        if duration.is_zero() {
            Ok(IdleTtl::Disabled)
        } else {
            Ok(IdleTtl::After(duration))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            IdleTtl::Disabled => None,
            IdleTtl::After(d) => Some(*d),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, IdleTtl::Disabled)
    }
}

impl Default for IdleTtl {
    fn default() -> Self {
        IdleTtl::After(Duration::from_secs(24 * 3600))
    }
}

impl fmt::Display for IdleTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleTtl::Disabled => f.write_str("0"),
            IdleTtl::After(d) => f.write_str(&format_duration(*d)),
        }
    }
}

impl FromStr for IdleTtl {
    type Err = TtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdleTtl {
    type Error = TtlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdleTtl> for String {
    fn from(ttl: IdleTtl) -> Self {
        ttl.to_string()
    }
}

/// Parse a duration such as `1h30m`, `2.5s` or `250ms`
///
/// Each component is a decimal number (optionally with a fraction) followed
/// by one of `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. Signs are not accepted.
pub fn parse_duration(input: &str) -> Result<Duration, TtlError> {
    if input.is_empty() {
        return Err(TtlError::Empty);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = input;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_len];
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(TtlError::Invalid(input.to_string()));
        }
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(TtlError::Invalid(input.to_string())),
            other => {
                return Err(TtlError::UnknownUnit {
                    unit: other.to_string(),
                    input: input.to_string(),
                })
            }
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| TtlError::Overflow(input.to_string()))?
        };
        let mut component = whole
            .checked_mul(unit_nanos)
            .ok_or_else(|| TtlError::Overflow(input.to_string()))?;

        let mut scale = unit_nanos;
        for digit in fraction.bytes().take(18) {
            scale /= 10;
            component += (digit - b'0') as u128 * scale;
        }

        total_nanos = total_nanos
            .checked_add(component)
            .ok_or_else(|| TtlError::Overflow(input.to_string()))?;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| TtlError::Overflow(input.to_string()))?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Compact rendering: `24h`, `1h30m`, `45s`, `1m0.5s`, `500ms`
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let total_secs = d.as_secs();
    let nanos = d.subsec_nanos();
    if total_secs == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else {
            format!("{}ns", nanos)
        };
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 || (hours > 0 && (secs > 0 || nanos > 0)) {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 || nanos > 0 {
        if nanos > 0 {
            let fraction = format!("{:09}", nanos);
            out.push_str(&format!("{}.{}s", secs, fraction.trim_end_matches('0')));
        } else {
            out.push_str(&format!("{}s", secs));
        }
    }
    out
}
