//! Human-readable durations (`"500ms"`, `"30s"`, `"1m 30s"`, `"2h"`).
//!
//! Parsing and formatting are `humantime`'s; configuration fields use
//! `humantime_serde`. Command-line flags additionally accept a bare integer
//! as seconds.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Parse a duration flag: a bare integer is seconds, anything else goes
/// through [`humantime::parse_duration`].
pub fn parse_duration(input: &str) -> CoreResult<Duration> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(trimmed)
        .map_err(|e| CoreError::InvalidDuration(format!("{}: {}", input, e)))
}

/// Format a duration in a form [`parse_duration`] accepts back.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
