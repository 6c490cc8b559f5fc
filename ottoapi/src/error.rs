//! Errors returned by the backend client.

use reqwest::StatusCode;

/// Result type for every call made through [crate::Client].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The http client itself could not be constructed.
    #[error("could not build http client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request did not complete before the client-side timeout.
    #[error("request to {url} timed out")]
    Timeout {
        /// Url the request was sent to.
        url: String,
    },

    /// The backend could not be reached, or the connection broke mid-request.
    #[error("request to {url} failed: {source}")]
    Transport {
        /// Url the request was sent to.
        url: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status code.
    #[error("{url} returned {status}: {message}")]
    Status {
        /// Url the request was sent to.
        url: String,
        /// Status code of the response.
        status: StatusCode,
        /// Message extracted from the body, or the raw body.
        message: String,
    },

    /// A success response carried a body we could not decode.
    #[error("could not decode response from {url}: {source}")]
    Decode {
        /// Url the request was sent to.
        url: String,
        /// Underlying decoding error.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { url: url.to_owned() }
        } else {
            Self::Transport {
                url: url.to_owned(),
                source: err,
            }
        }
    }

    pub(crate) fn status(url: &str, status: StatusCode, body: &str) -> Self {
        Self::Status {
            url: url.to_owned(),
            status,
            message: body_message(body),
        }
    }

    /// True when the request timed out on our side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Status code returned by the backend, if it answered at all.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Pull the human readable message out of an error body. The backend
/// answers `{"message": ...}` (sometimes `{"error": ...}`); anything else is
/// returned as text, truncated.
pub(crate) fn body_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(|m| m.as_str()) {
                return message.to_owned();
            }
        }
    }
    body.chars().take(200).collect()
}
