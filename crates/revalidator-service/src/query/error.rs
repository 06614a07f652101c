use std::time::Duration;

use thiserror::Error;

/// Failure of the origin to produce a current value.
///
/// Origin clients are expected to bound their requests with a timeout and surface it as
/// [`FetchError::Timeout`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The origin answered with a non-success status.
    #[error("origin responded with status {0}")]
    Status(u16),
    /// The origin did not answer in time.
    #[error("origin request timed out after {0:?}")]
    Timeout(Duration),
    /// The request never got an answer, e.g. connection loss or DNS failure.
    #[error("origin request failed: {0}")]
    Transport(String),
}

impl FetchError {
    /// The status code the origin answered with, if it answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}

/// Failure to obtain a valid current value from the origin.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("fetching the current value failed")]
    Fetch(#[from] FetchError),
    /// The origin answered, but with something that does not decode into the expected value.
    #[error("the current value is invalid")]
    InvalidValue {
        raw: serde_json::Value,
        #[source]
        error: serde_json::Error,
    },
}

impl RefreshError {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Fetch(error) => error.as_tag(),
            Self::InvalidValue { .. } => "invalid_value",
        }
    }
}

/// The error a caller of a [`Query`](super::Query) sees.
///
/// This only happens when the origin failed and nothing was cached to fall back to. Cache
/// backend failures are never visible here.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("internal error")]
    Internal(#[from] RefreshError),
}
