//! Provider adapter contract.
//!
//! A provider is one remote replica of the whole dataset. Adapters move an
//! opaque payload plus a provider-defined revision token; everything else
//! (clocks, migrations, conflict decisions) happens above them.

use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::ProviderId;
use tokio::sync::{Mutex, RwLock};

/// Opaque revision of the remote payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RevisionToken> for String {
    fn from(rev: RevisionToken) -> Self {
        rev.0
    }
}

/// Payload as stored remotely, with the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteData {
    pub data: Bytes,
    pub rev: RevisionToken,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &ProviderId;

    /// Current remote payload, or `None` if nothing was uploaded yet
    async fn pull(&self) -> ProviderResult<Option<RemoteData>>;

    /// Replaces the remote payload, but only if the remote is still at
    /// `expected` (`None`: only if the remote is empty). A mismatch fails
    /// with [`ProviderError::Conflict`] and leaves the remote untouched.
    async fn push(&self, data: Bytes, expected: Option<&RevisionToken>) -> ProviderResult<RevisionToken>;
}

// ─────────────────────────────────────────────────────
// In-memory provider
// ─────────────────────────────────────────────────────

/// Provider kept in process memory. Several engines can share one instance
/// to act as devices syncing through the same remote.
pub struct MemoryProvider {
    id: ProviderId,
    state: RwLock<Option<RemoteData>>,
    next_rev: AtomicU64,
    failures: Mutex<VecDeque<ProviderError>>,
}

impl MemoryProvider {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(None),
            next_rev: AtomicU64::new(1),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Makes the next call (pull or push) fail with `error`. Queued errors
    /// are returned in order before any call reaches the data.
    pub async fn fail_next(&self, error: ProviderError) {
        self.failures.lock().await.push_back(error);
    }

    /// Current revision, if anything was pushed
    pub async fn revision(&self) -> Option<RevisionToken> {
        self.state.read().await.as_ref().map(|d| d.rev.clone())
    }

    async fn injected_failure(&self) -> ProviderResult<()> {
        match self.failures.lock().await.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn pull(&self) -> ProviderResult<Option<RemoteData>> {
        self.injected_failure().await?;
        Ok(self.state.read().await.clone())
    }

    async fn push(&self, data: Bytes, expected: Option<&RevisionToken>) -> ProviderResult<RevisionToken> {
        self.injected_failure().await?;
        let mut state = self.state.write().await;
        let actual = state.as_ref().map(|d| &d.rev);
        if actual != expected {
            return Err(ProviderError::Conflict {
                expected: expected.cloned(),
                actual: actual.cloned(),
            });
        }
        let rev = RevisionToken::new(self.next_rev.fetch_add(1, Ordering::SeqCst).to_string());
        *state = Some(RemoteData {
            data,
            rev: rev.clone(),
        });
        Ok(rev)
    }
}
