//! Wire datetime parsing.
//!
//! The API emits ISO-8601 with an optional fractional-second component and
//! a literal `Z` suffix; both `%Y-%m-%dT%H:%M:%S.%fZ` and
//! `%Y-%m-%dT%H:%M:%SZ` must parse.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse an API-supplied timestamp into seconds since the Unix epoch.
/// Returns `None` for an empty/absent value or a string matching neither
/// accepted format (never panics — an unparsable date in a large listing
/// should not abort the whole sync phase).
pub fn api_datetime_to_time(text: Option<&str>) -> Option<f64> {
    let text = text?;
    if text.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ"];
    for fmt in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            let dt: DateTime<Utc> = DateTime::from_naive_utc_and_offset(naive, Utc);
            return Some(dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 / 1e9);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_seconds() {
        let t = api_datetime_to_time(Some("2018-06-08T09:06:53.310377Z")).unwrap();
        assert!((t - 1528448813.310377).abs() < 1e-3);
    }

    #[test]
    fn parses_whole_seconds() {
        let t = api_datetime_to_time(Some("2018-06-08T09:06:53Z")).unwrap();
        assert!((t - 1528448813.0).abs() < 1e-6);
    }

    #[test]
    fn none_input_yields_none() {
        assert_eq!(api_datetime_to_time(None), None);
        assert_eq!(api_datetime_to_time(Some("")), None);
        assert_eq!(api_datetime_to_time(Some("not-a-date")), None);
    }
}
