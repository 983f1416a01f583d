// Error taxonomy shared by the cache, token cache, transport and provider adapters

use std::collections::BTreeMap;
use thiserror::Error;

// Cause of a single provider failure.
// Clone so that one failed single-flight computation can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Provider API error: {status} - {detail}")]
    ProviderApi { status: u16, detail: String },

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Transport error: {message}")]
    Transport { message: String, timed_out: bool },

    #[error("Provider task failed: {0}")]
    TaskFailed(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl SearchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timed_out: true,
        }
    }

    // The core never retries on its own; this only tells the caller whether a retry may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::ProviderApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::ProviderApi { status: 401, .. })
    }
}

// A failure attributed to one vendor. The original cause stays reachable through `source()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{provider} failed: {source}")]
pub struct ProviderError {
    pub provider: String,
    #[source]
    pub source: SearchError,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, source: SearchError) -> Self {
        Self {
            provider: provider.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.source == SearchError::Cancelled
    }
}

// Top-level failure of an aggregated search
#[derive(Error, Debug, Clone)]
pub enum AggregationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider failures: {}", failed_providers(.0))]
    ProviderFailures(BTreeMap<String, ProviderError>),

    #[error("Search cancelled before any provider responded")]
    Cancelled,
}

fn failed_providers(failures: &BTreeMap<String, ProviderError>) -> String {
    failures
        .values()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_provider_error_keeps_original_cause() {
        let error = ProviderError::new(
            "gds",
            SearchError::ProviderApi {
                status: 503,
                detail: "upstream unavailable".to_string(),
            },
        );

        assert_eq!(
            error.to_string(),
            "gds failed: Provider API error: 503 - upstream unavailable"
        );
        let source = error.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Provider API error: 503 - upstream unavailable")
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SearchError::timeout("slow").is_retryable());
        assert!(SearchError::ProviderApi {
            status: 429,
            detail: String::new()
        }
        .is_retryable());
        assert!(!SearchError::ProviderApi {
            status: 400,
            detail: String::new()
        }
        .is_retryable());
        assert!(!SearchError::Credential("bad secret".to_string()).is_retryable());
        assert!(!SearchError::Configuration("missing".to_string()).is_retryable());
    }

    #[test]
    fn test_aggregation_error_lists_failures() {
        let mut failures = BTreeMap::new();
        failures.insert(
            "metasearch".to_string(),
            ProviderError::new("metasearch", SearchError::Cancelled),
        );
        let error = AggregationError::ProviderFailures(failures);
        assert_eq!(
            error.to_string(),
            "Provider failures: metasearch failed: Request cancelled"
        );
    }
}
