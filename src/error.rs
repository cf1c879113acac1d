use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of everything that can go wrong while talking to the
/// service or writing an asset. Retry decisions are made on this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, DNS failure, body interrupted before completion.
    TransientNetwork,
    RateLimited {
        retry_after: Option<Duration>,
    },
    ServerError {
        status: u16,
    },
    ClientError {
        status: u16,
    },
    Timeout,
    /// The request could not be built (bad URL, bad header value).
    InvalidRequest,
    /// The server answered with a body we could not decode.
    InvalidResponse,
    ActivationFailed,
    ActivationTimeout,
    SinkWrite,
    Cancelled,
}

impl ErrorKind {
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::ServerError { status },
            _ => Self::ClientError { status },
        }
    }

    pub fn is_retryable(self: &Self) -> bool {
        matches!(
            self,
            Self::TransientNetwork
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientNetwork => write!(f, "transient network error"),
            Self::RateLimited {
                retry_after: Some(d),
            } => write!(f, "rate limited (retry after {}s)", d.as_secs_f64()),
            Self::RateLimited { retry_after: None } => write!(f, "rate limited"),
            Self::ServerError { status } => write!(f, "server error ({status})"),
            Self::ClientError { status } => write!(f, "client error ({status})"),
            Self::Timeout => write!(f, "timed out"),
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::ActivationFailed => write!(f, "activation failed"),
            Self::ActivationTimeout => write!(f, "activation timed out"),
            Self::SinkWrite => write!(f, "sink write failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed call against the service, decoded from the transport error or
/// from the JSON error body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} from {url}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "", "operation cancelled")
    }

    pub fn is_cancelled(self: &Self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Terminates a page traversal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to fetch page {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: ApiError,
    },
    #[error("page link loop detected at {url}")]
    LinkLoop { url: String },
}

impl FetchError {
    /// The last URL the traversal attempted.
    pub fn url(self: &Self) -> &str {
        match self {
            Self::Http { url, .. } | Self::LinkLoop { url } => url,
        }
    }

    pub fn status(self: &Self) -> Option<u16> {
        match self {
            Self::Http { source, .. } => source.status,
            Self::LinkLoop { .. } => None,
        }
    }

    pub fn body(self: &Self) -> Option<&str> {
        match self {
            Self::Http { source, .. } => Some(&source.message),
            Self::LinkLoop { .. } => None,
        }
    }

    pub fn kind(self: &Self) -> ErrorKind {
        match self {
            Self::Http { source, .. } => source.kind,
            Self::LinkLoop { .. } => ErrorKind::InvalidResponse,
        }
    }
}
