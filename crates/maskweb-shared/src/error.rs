use serde_json::Value;
use thiserror::Error;

/// Failure of a request/response call.
///
/// Request failures are values, never panics: callers branch on the variant
/// to tell "never reached the server" from "reached it and was rejected".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// DNS, connect, TLS or timeout failure. Reported with status `-1`.
    #[error("Transport error: {0}")]
    Transport(String),

    /// 401/403: the credential is missing, expired or invalid.
    #[error("Unauthorized: HTTP status {status}")]
    Unauthorized { status: u16, body: Option<Value> },

    /// Any other non-2xx answer.
    #[error("HTTP error! status: {status}")]
    Rejected { status: u16, body: Option<Value> },

    /// 2xx answer whose envelope reports `success: false`.
    #[error("Request refused: {0}")]
    Refused(String),

    /// 2xx answer whose body does not match the expected shape.
    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status of the failure, `-1` when the server was never reached.
    pub fn status(&self) -> i32 {
        match self {
            ApiError::Transport(_) => -1,
            ApiError::Unauthorized { status, .. } | ApiError::Rejected { status, .. } => {
                i32::from(*status)
            }
            ApiError::Refused(_) | ApiError::Decode(_) => 200,
        }
    }

    pub fn reached_server(&self) -> bool {
        !matches!(self, ApiError::Transport(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Server-supplied error body, if any.
    pub fn body(&self) -> Option<&Value> {
        match self {
            ApiError::Unauthorized { body, .. } | ApiError::Rejected { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    /// Classify a non-2xx status.
    pub fn from_status(status: u16, body: Option<Value>) -> Self {
        match status {
            401 | 403 => ApiError::Unauthorized { status, body },
            _ => ApiError::Rejected { status, body },
        }
    }
}
