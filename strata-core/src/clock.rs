//! Per-provider sync clocks.
//!
//! Each configured provider has its own `(localChangedAt, remoteChangedAt,
//! lastSyncedAt)` triple in wall-clock milliseconds. Clocks are never shared
//! between providers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one configured sync provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The sync clock triple of one provider relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncClock {
    #[serde(default)]
    pub local_changed_at: i64,
    #[serde(default)]
    pub remote_changed_at: i64,
    #[serde(default)]
    pub last_synced_at: i64,
    /// Revision token the remote had when the clocks last agreed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_rev: Option<String>,
}

impl SyncClock {
    /// Records a local change. The stamp is strictly increasing even if the
    /// wall clock is not, and always lands after the last sync so a change
    /// made right after a sync is never mistaken for synced data.
    pub fn touch_local(&mut self, now: i64) {
        self.local_changed_at = now
            .max(self.local_changed_at + 1)
            .max(self.last_synced_at + 1);
    }

    /// Records that both sides agree: local data as of `synced_at` is what the
    /// remote stores under `rev`, and that data last changed remotely at
    /// `remote_changed_at`.
    pub fn mark_synced(&mut self, synced_at: i64, remote_changed_at: i64, rev: Option<String>) {
        self.local_changed_at = self.local_changed_at.max(synced_at);
        self.remote_changed_at = remote_changed_at;
        self.last_synced_at = synced_at.max(remote_changed_at);
        self.last_synced_rev = rev;
    }
}

/// Clocks of every configured provider, persisted as one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncClocks(BTreeMap<ProviderId, SyncClock>);

impl SyncClocks {
    pub fn get(&self, id: &ProviderId) -> Option<&SyncClock> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &ProviderId) -> Option<&mut SyncClock> {
        self.0.get_mut(id)
    }

    /// Adds a provider with a fresh clock. Returns false if it already exists.
    pub fn register(&mut self, id: ProviderId) -> bool {
        if self.0.contains_key(&id) {
            return false;
        }
        self.0.insert(id, SyncClock::default());
        true
    }

    pub fn remove(&mut self, id: &ProviderId) -> Option<SyncClock> {
        self.0.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Records a local change on every provider's clock. All clocks get the
    /// same stamp, which is returned: `now` or later if some clock is ahead.
    pub fn touch_local_all(&mut self, now: i64) -> i64 {
        let stamp = self
            .0
            .values()
            .map(|c| c.local_changed_at.max(c.last_synced_at) + 1)
            .fold(now, i64::max);
        for clock in self.0.values_mut() {
            clock.local_changed_at = stamp;
        }
        stamp
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
