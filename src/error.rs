// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of error kinds surfaced to callers.
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All variants are serializable so they can cross an async/FFI boundary intact.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum Error {
    /// Generic client-side invariant violation (bad args, bad state).
    #[error("Kinvey error: {0}")]
    Kinvey(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("No active user")]
    NoActiveUser,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Invalid cached query: {0}")]
    InvalidCachedQuery(String),

    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("No response from server")]
    NoResponse,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Kinvey(format!("serialization error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() || err.is_request() {
            Error::NoResponse
        } else {
            Error::ServerError(err.to_string())
        }
    }
}

impl Error {
    /// Whether an error encountered during the network phase of a Cache-mode
    /// read should be suppressed (cache result stands) rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ServerError(_) | Error::Timeout | Error::NoResponse)
    }
}

/// Maps a backend `error` response string (§6) to a typed [`Error`].
pub fn from_server_error_code(code: &str, message: &str) -> Error {
    match code {
        "InvalidCredentials" => Error::InvalidCredentials(message.to_string()),
        "InvalidGrant" => Error::InvalidGrant(message.to_string()),
        "KinveyInternalErrorRetry" => Error::ServerError(message.to_string()),
        "NotFound" => Error::NotFound(message.to_string()),
        "MissingConfiguration" => Error::MissingConfiguration(message.to_string()),
        "FeatureUnavailable" => Error::InvalidCachedQuery(message.to_string()),
        other => Error::Kinvey(format!("{other}: {message}")),
    }
}

/// Maps an HTTP status code (when the body carries no `error` field) to a typed [`Error`].
pub fn from_status(status: u16, body: &str) -> Error {
    match status {
        401 => Error::InvalidCredentials(body.to_string()),
        404 => Error::NotFound(body.to_string()),
        500..=599 => Error::ServerError(format!("HTTP {status}: {body}")),
        _ => Error::Kinvey(format!("HTTP {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_error_codes() {
        assert!(matches!(
            from_server_error_code("InvalidCredentials", "bad token"),
            Error::InvalidCredentials(_)
        ));
        assert!(matches!(
            from_server_error_code("FeatureUnavailable", "no deltaset"),
            Error::InvalidCachedQuery(_)
        ));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::ServerError("x".into()).is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(!Error::InvalidCredentials("x".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
    }
}
