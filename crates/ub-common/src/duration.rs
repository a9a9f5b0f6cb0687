//! Go `time.Duration` string parsing.
//!
//! The LAPI reports remaining ban durations in Go's duration syntax
//! ("4h", "1h30m", "3h59m42.568s", "250ms"). Config-file durations use
//! humantime instead; this parser exists only for decision payloads.

use std::time::Duration;

/// Parse a Go duration string into a [`Duration`].
///
/// Supported units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. Fractional values
/// are accepted ("2.5s"). Negative durations and junk return `None` — the
/// filter treats an unparseable duration as absent rather than rejecting.
pub fn parse_go_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    // Go prints "0s" for the zero duration.
    if s == "0" || s == "0s" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    let mut matched = false;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let (unit_secs, unit_len) = if rest.starts_with("ns") {
            (1e-9, 2)
        } else if rest.starts_with("us") {
            (1e-6, 2)
        } else if rest.starts_with("µs") {
            (1e-6, "µs".len())
        } else if rest.starts_with("ms") {
            (1e-3, 2)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else {
            return None;
        };
        rest = &rest[unit_len..];

        total += Duration::from_secs_f64(value * unit_secs);
        matched = true;
    }

    matched.then_some(total)
}
