use crate::{duration::ParseError, scheme::SchemeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Possible errors when working with resources and their store
#[derive(Error, Debug)]
pub enum Error {
    /// The store rejected or failed a request
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// A record could not be (de)serialized
    #[error("Error deserializing response: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// The type registry could not handle a record
    #[error("scheme error: {0}")]
    Scheme(#[from] SchemeError),

    /// A configured duration was invalid
    #[error("invalid duration: {0}")]
    Duration(#[from] ParseError),
}

impl Error {
    /// The store response, if this error came from the store
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Api(resp) => Some(resp),
            _ => None,
        }
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_not_found)
    }

    /// An optimistic concurrency check failed
    pub fn is_conflict(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_conflict)
    }

    /// The request may succeed if retried as-is
    pub fn is_transient(&self) -> bool {
        self.response().is_some_and(ErrorResponse::is_transient)
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Self {
        Error::Api(resp)
    }
}

/// An error response from the resource store.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// 404: the object does not exist
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self {
            status: "Failure".into(),
            message: format!("{what} not found"),
            reason: "NotFound".into(),
            code: 404,
        }
    }

    /// 409: the write was based on a stale `resourceVersion`
    pub fn conflict(what: impl std::fmt::Display) -> Self {
        Self {
            status: "Failure".into(),
            message: format!(
                "Operation cannot be fulfilled on {what}: the object has been modified; please apply your changes to the latest version and try again"
            ),
            reason: "Conflict".into(),
            code: 409,
        }
    }

    /// 409: an object with the same key already exists
    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Self {
            status: "Failure".into(),
            message: format!("{what} already exists"),
            reason: "AlreadyExists".into(),
            code: 409,
        }
    }

    /// 422: the object failed validation
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: "Invalid".into(),
            code: 422,
        }
    }

    /// 503: the store is temporarily unavailable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: "ServiceUnavailable".into(),
            code: 503,
        }
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// An optimistic concurrency check failed
    pub fn is_conflict(&self) -> bool {
        self.code == 409 && self.reason == "Conflict"
    }

    /// Throttling, timeouts and server-side failures
    pub fn is_transient(&self) -> bool {
        matches!(self.code, 429 | 500..=599) || self.is_conflict()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorResponse};

    #[test]
    fn classifies_store_responses() {
        let not_found = Error::from(ErrorResponse::not_found("guestbooks \"a\""));
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());
        assert!(!not_found.is_transient());

        let conflict = Error::from(ErrorResponse::conflict("guestbooks \"a\""));
        assert!(conflict.is_conflict());
        assert!(conflict.is_transient());

        assert!(!ErrorResponse::already_exists("x").is_conflict());
        assert!(ErrorResponse::unavailable("etcd leader election").is_transient());
        assert!(!ErrorResponse::invalid("bad").is_transient());
    }

    #[test]
    fn error_response_deserializes_from_status_payload() {
        let resp: ErrorResponse = serde_json::from_str(
            r#"{"status":"Failure","message":"guestbooks \"a\" not found","reason":"NotFound","code":404}"#,
        )
        .unwrap();
        assert_eq!(resp, ErrorResponse::not_found("guestbooks \"a\""));
    }
}
