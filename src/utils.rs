//! # Utilities

use crate::{Result, bad_request};

/// Normalize a protocol or schema URL: add a default scheme when absent and
/// strip any trailing slash so that equal URLs compare equal as strings.
///
/// # Errors
///
/// Returns a 400 `UrlProtocolNotNormalized` error when the URL cannot be
/// normalized (empty, or contains whitespace).
pub fn clean_url(url: &str) -> Result<String> {
    let trimmed = url.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(bad_request!("UrlProtocolNotNormalized: unable to normalize url: {url}"));
    }

    if trimmed.contains("://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{trimmed}"))
    }
}

/// Serde helpers for RFC 3339 timestamps with microsecond precision.
///
/// Message CIDs are computed over the serialized form, so every timestamp
/// must serialize identically no matter which code path produced it.
pub(crate) mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339_opts(Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<DateTime<Utc>>().map_err(serde::de::Error::custom)
    }
}

/// As [`rfc3339_micros`], for optional timestamps.
pub(crate) mod rfc3339_micros_opt {
    use chrono::{DateTime, SecondsFormat::Micros, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        date: &Option<DateTime<Utc>>, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => serializer.serialize_str(&date.to_rfc3339_opts(Micros, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        let Some(s) = s else {
            return Ok(None);
        };
        s.parse::<DateTime<Utc>>().map(Some).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_scheme() {
        assert_eq!(clean_url("example.com/chat").unwrap(), "http://example.com/chat");
    }

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(clean_url("https://example.com/chat/").unwrap(), "https://example.com/chat");
    }

    #[test]
    fn rejects_unnormalizable() {
        let err = clean_url("not a url").expect_err("should fail");
        assert!(err.detail().starts_with("UrlProtocolNotNormalized"));
    }
}
