//! Error types for the enrichment pipeline.

use std::time::Duration;

use crate::template::TemplateError;

/// Enrichment errors.
///
/// Everything except `Config` and `Unsupported` is contained to the record
/// that produced it; those two abort the batch before any record is touched.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// Connection or protocol error talking to the lookup API.
    #[error("network error: {message}")]
    Network { message: String },

    /// Lookup API answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// A single attempt exceeded its deadline.
    #[error("lookup timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Local address classification failed.
    #[error("local lookup failed for {address}: {reason}")]
    Local { address: String, reason: String },

    /// Response could not be read.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Template or expression error.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Requested lookup capability is not available in this environment.
    #[error("unsupported environment: {message}")]
    Unsupported { message: String },
}

impl EnrichError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Status { .. }
                | Self::Timeout { .. }
                | Self::Local { .. }
                | Self::InvalidResponse { .. }
        )
    }

    /// Whether the error must abort the batch before dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Unsupported { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for enrichment operations.
pub type EnrichResult<T> = Result<T, EnrichError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EnrichError::Status {
            status: 500,
            url: "http://x".into()
        }
        .is_retryable());
        assert!(EnrichError::Timeout {
            timeout: Duration::from_millis(5)
        }
        .is_retryable());
        assert!(!EnrichError::config("bad").is_retryable());
        assert!(!EnrichError::Unsupported {
            message: "no table".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EnrichError::config("bad method").is_fatal());
        assert!(!EnrichError::Network {
            message: "reset".into()
        }
        .is_fatal());
    }
}
