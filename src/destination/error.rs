use aws_sdk_codeartifact::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

use crate::retry::Retryable;

/// Service error codes worth another attempt.
const RETRYABLE_CODES: &[&str] = &[
    "ThrottlingException",
    "InternalServerException",
    "ServiceUnavailableException",
];

/// Destination registry errors with retry classification.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("{status}, {reason}, {body}")]
    UploadStatus {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("Upload to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Disk {
        path: String,
        source: std::io::Error,
    },

    #[error("version {version} of {package} not found in package manifest, skipping upload")]
    MissingFromManifest { package: String, version: String },

    #[error("{0}")]
    InvalidRequest(String),
}

impl DestinationError {
    /// Classify an AWS SDK error from the control-plane client.
    pub fn api<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: std::error::Error + ProvideErrorMetadata + 'static,
        R: std::fmt::Debug,
    {
        let retryable = match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                true
            }
            SdkError::ServiceError(service) => service
                .err()
                .code()
                .is_some_and(|code| RETRYABLE_CODES.contains(&code)),
            _ => false,
        };
        Self::Api {
            operation,
            message: DisplayErrorContext(&err).to_string(),
            retryable,
        }
    }
}

impl Retryable for DestinationError {
    fn is_retryable(&self) -> bool {
        match self {
            DestinationError::Api { retryable, .. } => *retryable,
            DestinationError::UploadStatus { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            DestinationError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            DestinationError::Disk { .. }
            | DestinationError::MissingFromManifest { .. }
            | DestinationError::InvalidRequest(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(status: u16) -> DestinationError {
        DestinationError::UploadStatus {
            status,
            reason: "reason".into(),
            body: String::new(),
        }
    }

    #[test]
    fn test_upload_status_classification() {
        assert!(upload(503).is_retryable());
        assert!(upload(429).is_retryable());
        assert!(!upload(400).is_retryable());
        assert!(!upload(409).is_retryable());
    }

    #[test]
    fn test_upload_status_message() {
        let e = DestinationError::UploadStatus {
            status: 400,
            reason: "Bad Request".into(),
            body: "invalid version".into(),
        };
        assert_eq!(e.to_string(), "400, Bad Request, invalid version");
    }

    #[test]
    fn test_api_flag_respected() {
        let throttled = DestinationError::Api {
            operation: "describe_package_version",
            message: "ThrottlingException".into(),
            retryable: true,
        };
        assert!(throttled.is_retryable());
        let denied = DestinationError::Api {
            operation: "describe_package_version",
            message: "AccessDeniedException".into(),
            retryable: false,
        };
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_missing_from_manifest_not_retryable() {
        let e = DestinationError::MissingFromManifest {
            package: "left-pad".into(),
            version: "9.9.9".into(),
        };
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("not found in package manifest"));
    }
}
