//! Error types for chunkstream

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// The `Range` header is not of the form `bytes=<start>-[end]`
    #[error("Malformed range: {0}")]
    MalformedRange(String),

    /// The range is well formed but cannot be served for this resource
    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An upload exceeded the configured size limit
    #[error("Upload larger than {0} bytes")]
    UploadTooLarge(u64),

    /// The source exists but has not been partitioned yet
    #[error("Source not processed yet: {0}")]
    NotProcessed(String),

    /// Storage I/O failure (open, seek, read, write)
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more sources in a partition batch failed
    #[error("Partition batch failed for {failed} of {total} sources: {}", errors.join("; "))]
    PartialBatchFailure {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    /// Input does not match the container format a partitioner expects
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// External segmenting tool failed
    #[error("Segmenter error: {0}")]
    Segmenter(String),

    /// Another worker holds the claim on this source
    #[error("Source already claimed: {0}")]
    ClaimConflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to when surfaced by the stream server
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::MalformedRange(_)
            | Error::MissingParameter(_)
            | Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            Error::UploadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotProcessed(_) | Error::ClaimConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::MalformedRange("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::RangeNotSatisfiable("x".into()).status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            Error::UploadTooLarge(10).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            Error::MissingParameter("id").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(
            Error::from(io).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_partial_batch_message() {
        let err = Error::PartialBatchFailure {
            failed: 1,
            total: 2,
            errors: vec!["a: boom".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Partition batch failed for 1 of 2 sources: a: boom"
        );
    }
}
