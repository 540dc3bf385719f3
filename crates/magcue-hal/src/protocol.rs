//! Line Protocol Parser for the sensor board's text output.
//!
//! The firmware prints one of two line shapes:
//!
//! | Shape | Example | Matcher |
//! |---|---|---|
//! | Verbose | `Raw: 358  Distance: 12.50 %` | [`match_verbose`] |
//! | Compact (plotter mode) | `358 12.50` | [`match_compact`] |
//!
//! [`parse`] composes both matchers into a [`ParsedLine`].  Range checking
//! happens in the session; the parser only answers "is there a number
//! here".

/// Marker that introduces the percentage in a verbose line.
pub const DISTANCE_MARKER: &str = "Distance:";

/// Marker that must accompany [`DISTANCE_MARKER`] for a verbose line to count
/// as telemetry.
pub const RAW_MARKER: &str = "Raw:";

/// Result of classifying one device line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A line carrying a distance percentage (not yet range-checked).
    DistanceLine { percent: f64 },
    /// A `Distance:` line without the `Raw:` marker.
    InfoLine { text: String },
    /// Anything else: boot banners, debug prints, garbage.
    Unrecognized { raw: String },
}

/// Classify one line of device output.
///
/// Surrounding whitespace is ignored.
pub fn parse(line: &str) -> ParsedLine {
    let trimmed = line.trim();

    if let Some(percent) = match_verbose(trimmed) {
        return ParsedLine::DistanceLine { percent };
    }
    if let Some(percent) = match_compact(trimmed) {
        return ParsedLine::DistanceLine { percent };
    }
    if trimmed.contains(DISTANCE_MARKER) && !trimmed.contains(RAW_MARKER) {
        return ParsedLine::InfoLine {
            text: trimmed.to_string(),
        };
    }
    ParsedLine::Unrecognized {
        raw: line.to_string(),
    }
}

/// Match the verbose shape: `Raw: <int>  Distance: <float>[ %]`.
///
/// Both markers must be present, `Raw:` first.  The value is the first
/// decimal number after `Distance:`; a trailing `%` is optional.
pub fn match_verbose(line: &str) -> Option<f64> {
    let (_, after_raw) = line.split_once(RAW_MARKER)?;
    let (_, after) = after_raw.split_once(DISTANCE_MARKER)?;
    leading_decimal(after.trim_start())
}

/// Match the compact shape: exactly two whitespace-separated tokens, an
/// integer raw count (discarded) and a decimal percentage.
pub fn match_compact(line: &str) -> Option<f64> {
    let mut tokens = line.split_whitespace();
    let raw = tokens.next()?;
    let value = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    finite(value)
}

/// Extract the decimal number at the start of `text`: digits with at most
/// one decimal point.
fn leading_decimal(text: &str) -> Option<f64> {
    let mut seen_point = false;
    let end = text
        .char_indices()
        .find(|&(_, c)| {
            if c.is_ascii_digit() {
                false
            } else if c == '.' && !seen_point {
                seen_point = true;
                false
            } else {
                true
            }
        })
        .map_or(text.len(), |(i, _)| i);
    finite(&text[..end])
}

fn finite(number: &str) -> Option<f64> {
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}
