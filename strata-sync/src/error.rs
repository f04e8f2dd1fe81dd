//! Error types for sync passes and provider adapters

use crate::provider::RevisionToken;
use std::time::Duration;
use strata_core::{ProviderId, StrataError};

/// Result type for provider adapter calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures reported by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transient failure talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend asked us to slow down, optionally saying for how long
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials are missing, invalid or expired. Retrying cannot help.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote is no longer at the revision the push was based on
    #[error("Revision conflict: expected {expected:?}, remote is at {actual:?}")]
    Conflict {
        expected: Option<RevisionToken>,
        actual: Option<RevisionToken>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the same call may succeed if repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::Timeout(_) | ProviderError::RateLimited { .. }
        )
    }

    /// How long the provider asked us to wait, if it said so
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors of one sync pass. Always scoped to a single provider.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Provider '{provider}' failed: {source}")]
    Provider {
        provider: ProviderId,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Core(#[from] StrataError),

    #[error("Invalid sync payload: {0}")]
    Payload(String),

    #[error("Unknown sync provider: {0}")]
    UnknownProvider(ProviderId),

    /// Remote data was requested but the provider holds none
    #[error("Provider '{0}' has no data")]
    RemoteEmpty(ProviderId),
}

impl SyncError {
    pub fn provider(provider: &ProviderId, source: ProviderError) -> Self {
        SyncError::Provider {
            provider: provider.clone(),
            source,
        }
    }

    /// Whether the user has to act (re-authenticate, update the app) before
    /// syncing can succeed again
    pub fn needs_user_action(&self) -> bool {
        match self {
            SyncError::Provider { source, .. } => matches!(source, ProviderError::Auth(_)),
            SyncError::Core(StrataError::Integrity(_)) => true,
            SyncError::Core(e) => e.is_fatal(),
            _ => false,
        }
    }
}
