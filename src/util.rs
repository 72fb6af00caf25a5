use chrono::{DateTime, Utc};

/// Timestamp layout the catalog uses for `acquired` and for the sync watermark.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";
/// Same layout for timestamps that carry sub-microsecond digits.
const TIMESTAMP_FORMAT_NANOS: &str = "%Y-%m-%dT%H:%M:%S%.9f+00:00";

/// Format a timestamp the way the catalog expects it in filters.
///
/// Microseconds are the catalog's precision; finer timestamps keep all nine
/// digits so a watermark never sorts before the scene it came from.
pub fn format_timestamp(when: &DateTime<Utc>) -> String {
    if when.timestamp_subsec_nanos() % 1_000 == 0 {
        when.format(TIMESTAMP_FORMAT).to_string()
    } else {
        when.format(TIMESTAMP_FORMAT_NANOS).to_string()
    }
}

/// Parse a catalog timestamp.
///
/// Anything RFC 3339 is accepted, so `Z` suffixes and other offsets parse as
/// well as the canonical `+00:00` form.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|when| when.with_timezone(&Utc))
}

/// Parse filename from Content-Disposition header
/// Returns Some(filename) if successful, None otherwise
#[tracing::instrument(level = "trace", ret)]
pub fn parse_content_disposition(content_disposition: &str) -> Option<String> {
    // filename*=UTF-8''... (RFC 5987) wins over the plain form when both are present
    if let Some(pos) = content_disposition.find("filename*=UTF-8''") {
        let start = pos + "filename*=UTF-8''".len();
        let end = content_disposition[start..]
            .find(|c: char| c.is_whitespace() || c == ';')
            .unwrap_or(content_disposition[start..].len());

        if end > 0 {
            let encoded = &content_disposition[start..(start + end)];
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return Some(decoded.into_owned());
            }
        }
    }

    // filename="..." (RFC 6266)
    if let Some(pos) = content_disposition.find("filename=\"") {
        let start = pos + "filename=\"".len();
        if let Some(end) = content_disposition[start..].find('"') {
            if end > 0 {
                return Some(content_disposition[start..(start + end)].to_string());
            }
        }
    }

    // filename=... without quotes
    if let Some(pos) = content_disposition.find("filename=") {
        let start = pos + "filename=".len();
        let end = content_disposition[start..]
            .find(|c: char| c.is_whitespace() || c == ';')
            .unwrap_or(content_disposition[start..].len());

        if end > 0 {
            return Some(content_disposition[start..(start + end)].to_string());
        }
    }

    None
}
