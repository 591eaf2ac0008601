// SPDX-License-Identifier: MIT

//! Error types shared by the Sesame server and client.

use http::StatusCode;
use serde::{Deserialize, Serialize};

pub use crate::token::TokenError;

/// An error with an associated HTTP status code.
///
/// Handlers and pipeline stages return this type; the status code it carries
/// is the single source of truth for the status code of the response being
/// written. Anything else that reaches the pipeline's error funnel is wrapped
/// into one of these with a 500 status.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    /// The HTTP status code the response should carry.
    pub status_code: StatusCode,
    /// A human-readable description, sanitized before it leaves the server.
    pub message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

// The wire form of an error only carries the message; the status code
// travels in the response envelope and on the HTTP status line.
impl Serialize for ApiError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ApiError", 1)?;
        state.serialize_field("message", &self.message)?;
        state.end()
    }
}

/// How much error detail is exposed to HTTP peers.
///
/// `/open` and `/close` always use [`ErrorLevel::Full`] since they are only
/// reachable behind mTLS; `/join` speaks to unauthenticated peers and uses
/// the configured level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    /// Responses carry no error message at all; only the status code conveys
    /// failure.
    None,
    /// Responses carry a generic message per status class.
    #[default]
    Minimal,
    /// The original error message is passed through.
    Full,
}

/// Reduce an error to what the configured level allows peers to see.
pub fn sanitize_error(error: ApiError, level: ErrorLevel) -> Option<ApiError> {
    match level {
        ErrorLevel::None => None,
        ErrorLevel::Minimal => {
            let message = match error.status_code {
                StatusCode::UNAUTHORIZED => "authentication failed",
                StatusCode::BAD_REQUEST => "invalid request",
                _ => "request failed",
            };
            Some(ApiError::new(error.status_code, message))
        }
        ErrorLevel::Full => Some(error),
    }
}

/// Errors the [`crate::client::Client`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// An error occurred while talking to the remote Sesame node. This may be
    /// a transient networking problem, a timeout, or a TLS failure; whether a
    /// retry succeeds depends on the specific error.
    #[error("request to the remote node failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote node responded with an error status.
    ///
    /// Retrying will not help for 4xx statuses; the request (or the
    /// credentials behind it) needs to change.
    #[error("the remote node responded with {status}: {message}")]
    Api { status: StatusCode, message: String },

    /// The supplied invite token could not be decoded.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A response could not be decoded: invalid base58 framing, failed
    /// decryption, or a malformed JSON envelope.
    #[error("failed decoding the response: {0}")]
    Decode(String),

    /// A general I/O error, such as credentials that cannot be read from or
    /// written to the filesystem.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// A cryptographic operation failed. This is likely a bug or corrupted
    /// key material; retrying will not help.
    #[error(transparent)]
    Crypto(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_none_drops_the_error() {
        let error = ApiError::unauthorized("invite not found");
        assert_eq!(None, sanitize_error(error, ErrorLevel::None));
    }

    #[test]
    fn sanitize_minimal_keeps_the_status_class() {
        let error = sanitize_error(
            ApiError::unauthorized("invite not found"),
            ErrorLevel::Minimal,
        )
        .unwrap();
        assert_eq!(StatusCode::UNAUTHORIZED, error.status_code);
        assert_eq!("authentication failed", error.message);

        let error =
            sanitize_error(ApiError::bad_request("bad JSON"), ErrorLevel::Minimal).unwrap();
        assert_eq!("invalid request", error.message);

        let error =
            sanitize_error(ApiError::internal("db exploded"), ErrorLevel::Minimal).unwrap();
        assert_eq!("request failed", error.message);
    }

    #[test]
    fn sanitize_full_passes_through() {
        let error = ApiError::bad_request("unknown service");
        assert_eq!(
            Some(error.clone()),
            sanitize_error(error, ErrorLevel::Full)
        );
    }

    #[test]
    fn wire_form_only_exposes_the_message() {
        let error = ApiError::unauthorized("nope");
        assert_eq!(
            serde_json::json!({"message": "nope"}),
            serde_json::to_value(&error).unwrap()
        );
    }
}
