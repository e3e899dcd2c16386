use thiserror::Error;

/// Failures surfaced by the API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Blank admin key, malformed base URL, or no server configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server rejected the device credentials, or login returned no token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("credential store error: {0}")]
    Storage(anyhow::Error),
}

/// Network-layer failures, each carrying the URL that was being contacted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {url}")]
    ConnectionRefused { url: String },

    #[error("could not resolve host: {url}")]
    Dns { url: String },

    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

impl TransportError {
    pub fn url(&self) -> &str {
        match self {
            TransportError::ConnectionRefused { url }
            | TransportError::Dns { url }
            | TransportError::Timeout { url }
            | TransportError::Other { url, .. } => url,
        }
    }

    /// Same failure kind, re-targeted at `url`.
    pub fn with_url(self, url: impl Into<String>) -> Self {
        let url = url.into();
        match self {
            TransportError::ConnectionRefused { .. } => TransportError::ConnectionRefused { url },
            TransportError::Dns { .. } => TransportError::Dns { url },
            TransportError::Timeout { .. } => TransportError::Timeout { url },
            TransportError::Other { message, .. } => TransportError::Other { url, message },
        }
    }
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
