//! Error types for cartridge storage and discovery.

use thiserror::Error;

/// Errors surfaced by the record codecs, backend drivers and pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// Network timeout, 5xx or rate limiting. Retried with backoff.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// A payload that is not the expected record kind or has a bad layout.
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("writer {0} is not authorized to write")]
    NotAuthorized(String),

    #[error("writer {0} is locked")]
    WriterLocked(String),

    /// The backend has no consensus or is otherwise not accepting writes.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("integrity failure for cartridge {cartridge_id}: expected checksum {expected}, got {actual}")]
    IntegrityFailure {
        cartridge_id: u32,
        expected: String,
        actual: String,
    },

    /// Header missing or fewer chunks than expected. Writes may still be propagating.
    #[error("incomplete upload: {0}")]
    IncompleteUpload(String),

    /// The backend answered but refused the request (4xx, JSON-RPC error).
    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a single backend call should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether the caller may re-run the whole operation later and expect progress.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::IncompleteUpload(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Error::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Error::Transient(err.to_string())
            }
            Some(_) => Error::Rejected(err.to_string()),
            None if err.is_decode() => Error::Malformed(err.to_string()),
            None => Error::Transient(err.to_string()),
        }
    }
}

/// Result type alias for cartridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::Rejected("bad params".into()).is_transient());
        assert!(!Error::WriterLocked("NQ00".into()).is_transient());
    }

    #[test]
    fn caller_retryable_includes_incomplete_upload() {
        assert!(Error::IncompleteUpload("header not found".into()).is_retryable_by_caller());
        assert!(!Error::IntegrityFailure {
            cartridge_id: 7,
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .is_retryable_by_caller());
    }
}
