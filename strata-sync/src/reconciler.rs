//! Sync reconciliation.
//!
//! Decides from a provider's clock triple which way data has to move. The
//! decision is a pure function: no I/O, no wall clock.

use crate::provider::RevisionToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_core::SyncClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Neither side changed since they last agreed.
    InSync,
    /// Only the remote changed: pull.
    LocalUpdateRequired,
    /// Only local data changed: push.
    RemoteUpdateRequired,
    /// Both sides changed: needs a manual decision.
    DataDiverged,
    /// Both sides already hold the same data, only `lastSyncedAt` lags behind.
    LastSyncNotUpToDate,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::InSync => "in sync",
            SyncStatus::LocalUpdateRequired => "local update required",
            SyncStatus::RemoteUpdateRequired => "remote update required",
            SyncStatus::DataDiverged => "data diverged",
            SyncStatus::LastSyncNotUpToDate => "last sync not up to date",
        };
        f.write_str(s)
    }
}

/// Classifies a `(local, remote, last_sync)` triple. Ties count as "not
/// newer".
///
/// When both sides changed this returns [`SyncStatus::DataDiverged`]; telling
/// a stale bookkeeping entry apart from a real divergence needs the remote
/// revision, see [`reconcile`].
pub fn classify(local: i64, remote: i64, last_sync: i64) -> SyncStatus {
    match (local > last_sync, remote > last_sync) {
        (false, false) => SyncStatus::InSync,
        (false, true) => SyncStatus::LocalUpdateRequired,
        (true, false) => SyncStatus::RemoteUpdateRequired,
        (true, true) => SyncStatus::DataDiverged,
    }
}

/// Decides what a sync pass has to do for one provider.
///
/// `remote_rev` is the revision the remote reported in this pass. Both sides
/// are only considered equal, rather than diverged, if they carry the same
/// change time and the remote still holds the revision recorded at the last
/// successful sync.
pub fn reconcile(clock: &SyncClock, remote_rev: Option<&RevisionToken>) -> SyncStatus {
    let status = classify(
        clock.local_changed_at,
        clock.remote_changed_at,
        clock.last_synced_at,
    );
    if status != SyncStatus::DataDiverged || clock.local_changed_at != clock.remote_changed_at {
        return status;
    }
    match (remote_rev, clock.last_synced_rev.as_deref()) {
        (Some(rev), Some(last)) if rev.as_str() == last => SyncStatus::LastSyncNotUpToDate,
        _ => SyncStatus::DataDiverged,
    }
}
