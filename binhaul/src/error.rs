//! Engine-wide error types.

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} on {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("target plugin unusable: {reason}")]
    Plugin { reason: String },

    #[error("source query failed: {reason}")]
    SourceQuery { reason: String },

    #[error("chunk rejected by target: {reason}")]
    ChunkRejected { reason: String },

    #[error("another transfer holds the lock file {path}")]
    LockHeld { path: PathBuf },

    #[error("state I/O error while {operation} {path}: {source}")]
    StateIo {
        operation: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("delayed artifacts handling failed: {reason}")]
    DelayedArtifacts { reason: String },

    #[error("{phase} failed for repository `{repo}`: {reason}")]
    Phase {
        phase: &'static str,
        repo: String,
        reason: String,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TransferError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn plugin(reason: impl Into<String>) -> Self {
        Self::Plugin {
            reason: reason.into(),
        }
    }

    pub fn source_query(reason: impl Into<String>) -> Self {
        Self::SourceQuery {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn state_io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StateIo {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Transport-level failures worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// 401/403 from the target, the signature of credentials replaced by the
    /// config-transfer step. Handled by rebuilding the client, not by failing.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus {
                status: StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN,
                ..
            }
        )
    }
}
