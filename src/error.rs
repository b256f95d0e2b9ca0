//! # Errors
//!
//! Typed errors for message processing. Each variant maps to the HTTP-aligned
//! status code returned in the endpoint [`crate::endpoint::Status`]. Detail
//! strings open with a stable token so callers (and tests) can match on the
//! failure kind without parsing prose.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by message handlers.
#[derive(Error, Debug, Deserialize, Serialize)]
pub enum Error {
    /// The message failed an integrity check (malformed descriptor, CID or
    /// immutable-field mismatch, non-normalized URL, etc.).
    #[error("{0}")]
    BadRequest(String),

    /// Authentication failed — the message signature could not be verified.
    #[error("{0}")]
    Unauthorized(String),

    /// Authorization failed — the signer is not permitted to perform the
    /// operation.
    #[error("{0}")]
    Forbidden(String),

    /// No matching record, blob, or protocol configuration was found.
    #[error("{0}")]
    NotFound(String),

    /// The message lost the `(messageTimestamp, messageCid)` ordering race
    /// against an existing version.
    #[error("{0}")]
    Conflict(String),

    /// An internal invariant was violated while processing the message.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// The HTTP-aligned status code for this error.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Unexpected(_) => 400,
            Self::Unauthorized(_) | Self::Forbidden(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
        }
    }

    /// The error detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest(detail)
            | Self::Unauthorized(detail)
            | Self::Forbidden(detail)
            | Self::NotFound(detail)
            | Self::Conflict(detail)
            | Self::Unexpected(detail) => detail,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<base64ct::Error> for Error {
    fn from(err: base64ct::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

/// Construct an [`Error::Unexpected`] from a format string.
#[macro_export]
macro_rules! unexpected {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Unexpected(format!($fmt, $($arg)*))
    };
    ($fmt:expr) => {
        $crate::Error::Unexpected(format!($fmt))
    };
}

/// Construct an [`Error::Forbidden`] from a format string.
#[macro_export]
macro_rules! forbidden {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Forbidden(format!($fmt, $($arg)*))
    };
    ($fmt:expr) => {
        $crate::Error::Forbidden(format!($fmt))
    };
}

/// Construct an [`Error::BadRequest`] from a format string.
#[macro_export]
macro_rules! bad_request {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadRequest(format!($fmt, $($arg)*))
    };
    ($fmt:expr) => {
        $crate::Error::BadRequest(format!($fmt))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::BadRequest(String::new()).code(), 400);
        assert_eq!(Error::Unauthorized(String::new()).code(), 401);
        assert_eq!(Error::Forbidden(String::new()).code(), 401);
        assert_eq!(Error::NotFound(String::new()).code(), 404);
        assert_eq!(Error::Conflict(String::new()).code(), 409);
        assert_eq!(Error::Unexpected(String::new()).code(), 400);
    }

    #[test]
    fn macro_formatting() {
        let err = unexpected!("bad thing: {}", 42);
        assert_eq!(err.detail(), "bad thing: 42");
    }
}
