//! Shared utility functions used across multiple modules.

use chrono::{DateTime, SecondsFormat, Utc};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Parse an RFC 3339 timestamp into Unix milliseconds.
///
/// Missing or unparsable input yields `0` so it can never win a
/// last-write-wins comparison against a well-formed timestamp.
pub fn timestamp_millis(value: Option<&str>) -> i64 {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map_or(0, |parsed| parsed.timestamp_millis())
}

/// Render Unix milliseconds as an RFC 3339 UTC timestamp with millisecond precision.
pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
    }

    #[test]
    fn timestamp_millis_treats_garbage_as_epoch() {
        assert_eq!(timestamp_millis(None), 0);
        assert_eq!(timestamp_millis(Some("")), 0);
        assert_eq!(timestamp_millis(Some("yesterday-ish")), 0);
        assert_eq!(
            timestamp_millis(Some("2024-01-01T00:00:00Z")),
            1_704_067_200_000
        );
    }

    #[test]
    fn timestamp_millis_honours_offsets() {
        assert_eq!(
            timestamp_millis(Some("2024-01-01T01:00:00+01:00")),
            timestamp_millis(Some("2024-01-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn format_timestamp_round_trips_through_parse() {
        let formatted = format_timestamp(1_704_067_200_123);
        assert_eq!(formatted, "2024-01-01T00:00:00.123Z");
        assert_eq!(timestamp_millis(Some(&formatted)), 1_704_067_200_123);
    }
}
