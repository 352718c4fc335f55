use thiserror::Error;

use crate::retry::Retryable;

/// Source inventory errors with retry classification.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("Unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Disk error writing {path}: {source}")]
    Disk {
        path: String,
        source: std::io::Error,
    },
}

impl Retryable for SourceError {
    /// Overload and unavailability statuses plus transport failures are
    /// transient; everything else (auth, not found, bad JSON) is not.
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::HttpStatus { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            SourceError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            SourceError::InvalidResponse { .. } | SourceError::Disk { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> SourceError {
        SourceError::HttpStatus {
            status,
            url: "https://src/api/storageinfo".into(),
        }
    }

    #[test]
    fn test_overload_statuses_retryable() {
        for s in [429, 500, 502, 503, 504] {
            assert!(status(s).is_retryable(), "{s} should be retryable");
        }
    }

    #[test]
    fn test_client_errors_not_retryable() {
        for s in [400, 401, 403, 404, 501] {
            assert!(!status(s).is_retryable(), "{s} should not be retryable");
        }
    }

    #[test]
    fn test_invalid_response_not_retryable() {
        let e = SourceError::InvalidResponse {
            url: "x".into(),
            message: "expected value".into(),
        };
        assert!(!e.is_retryable());
    }
}
