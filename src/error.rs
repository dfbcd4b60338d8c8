use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{url} unreachable: {reason}")]
    Unreachable {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("{url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
}

impl FetchError {
    pub fn unreachable(url: &str, reason: impl Into<String>) -> Self {
        FetchError::Unreachable {
            url: url.to_string(),
            status: None,
            reason: reason.into(),
        }
    }

    pub fn status(url: &str, status: u16) -> Self {
        FetchError::Unreachable {
            url: url.to_string(),
            status: Some(status),
            reason: format!("HTTP {status}"),
        }
    }

    /// Rate limits and transient upstream failures are worth another tier-1 attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Unreachable {
                status: Some(429 | 500 | 502 | 503),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("no document for {url}: {source}")]
    NoDocument {
        url: String,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("empty response")]
    Empty,
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(err: serde_json::Error) -> Self {
        CollaboratorError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("image {url} returned HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("image {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
}
