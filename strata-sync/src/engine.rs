//! Sync engine: one pass per provider.
//!
//! A pass pulls the remote payload, updates the provider's clock from it and
//! lets the reconciler decide. Remote data is always merged locally before
//! anything is pushed, and a push only succeeds against the revision it was
//! based on. Diverged data is reported, never overwritten.

use crate::error::{ProviderError, Result, SyncError};
use crate::payload::RemotePayload;
use crate::provider::{ProviderAdapter, RevisionToken};
use crate::reconciler::{SyncStatus, reconcile};
use crate::retry::RetryPolicy;
use crate::scheduler::{SyncRunner, SyncTrigger};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use strata_core::{PersistenceGateway, ProviderId, StrataError, SyncClock, validate_app_data};
use tokio::sync::{Mutex, RwLock, broadcast};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Both sides changed since they last agreed
    BothChanged,
    /// Another device pushed between our pull and our push
    RemoteChangedDuringPush,
}

/// Everything the user needs to decide which side wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub provider: ProviderId,
    pub reason: ConflictReason,
    pub local_changed_at: i64,
    pub remote_changed_at: i64,
    pub last_synced_at: i64,
    pub remote_rev: Option<RevisionToken>,
}

impl ConflictInfo {
    fn new(
        provider: &ProviderId,
        reason: ConflictReason,
        clock: &SyncClock,
        remote_rev: Option<RevisionToken>,
    ) -> Self {
        Self {
            provider: provider.clone(),
            reason,
            local_changed_at: clock.local_changed_at,
            remote_changed_at: clock.remote_changed_at,
            last_synced_at: clock.last_synced_at,
            remote_rev,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    InSync,
    /// Remote data replaced the local data
    Pulled,
    /// Local data replaced the remote data
    Pushed,
    /// The remote was empty and got the local data
    InitialPush,
    /// Only `lastSyncedAt` moved
    BookkeepingOnly,
    /// Nothing was moved; needs [`SyncEngine::resolve_conflict`]
    Diverged(ConflictInfo),
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::InSync => f.write_str("in sync"),
            SyncOutcome::Pulled => f.write_str("pulled remote data"),
            SyncOutcome::Pushed => f.write_str("pushed local data"),
            SyncOutcome::InitialPush => f.write_str("uploaded initial data"),
            SyncOutcome::BookkeepingOnly => f.write_str("updated sync time"),
            SyncOutcome::Diverged(info) => write!(f, "diverged ({:?})", info.reason),
        }
    }
}

/// Manual answer to a divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the remote with local data
    UseLocal,
    /// Overwrite local data with the remote
    UseRemote,
}

/// Published after every pass
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Completed {
        provider: ProviderId,
        outcome: SyncOutcome,
    },
    Failed {
        provider: ProviderId,
        error: String,
        needs_user_action: bool,
    },
}

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    /// Held for the whole pass
    pass: Mutex<()>,
}

pub struct SyncEngine {
    gateway: Arc<PersistenceGateway>,
    providers: RwLock<BTreeMap<ProviderId, Arc<ProviderSlot>>>,
    retry: RetryPolicy,
    compress: bool,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(gateway: Arc<PersistenceGateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            gateway,
            providers: RwLock::new(BTreeMap::new()),
            retry: RetryPolicy::default(),
            compress: true,
            events,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Adds a provider and registers its sync clock. Replaces the adapter of
    /// a provider with the same id but keeps its clock.
    pub async fn add_provider(&self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let id = adapter.id().clone();
        self.gateway.register_provider(id.clone()).await?;
        let slot = Arc::new(ProviderSlot {
            adapter,
            pass: Mutex::new(()),
        });
        if self.providers.write().await.insert(id.clone(), slot).is_some() {
            tracing::info!("Replaced adapter of sync provider {}", id);
        }
        Ok(())
    }

    /// Removes a provider and forgets its clock.
    pub async fn remove_provider(&self, id: &ProviderId) -> Result<bool> {
        let removed = self.providers.write().await.remove(id).is_some();
        self.gateway.remove_provider(id).await?;
        Ok(removed)
    }

    pub async fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.read().await.keys().cloned().collect()
    }

    async fn slot(&self, id: &ProviderId) -> Result<Arc<ProviderSlot>> {
        self.providers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownProvider(id.clone()))
    }

    /// Runs one pass against `id`. Waits if a pass for it is already running.
    pub async fn sync_provider(&self, id: &ProviderId) -> Result<SyncOutcome> {
        let result = self.run_pass(id).await;
        self.publish(id, &result);
        result
    }

    /// Runs a pass for every provider concurrently. A failing provider does
    /// not affect the others.
    pub async fn sync_all(&self) -> Vec<(ProviderId, Result<SyncOutcome>)> {
        let ids = self.provider_ids().await;
        let passes = ids.into_iter().map(|id| async move {
            let result = self.sync_provider(&id).await;
            (id, result)
        });
        futures::future::join_all(passes).await
    }

    /// Settles a divergence by overwriting one side.
    pub async fn resolve_conflict(&self, id: &ProviderId, resolution: Resolution) -> Result<SyncOutcome> {
        let result = self.run_resolution(id, resolution).await;
        self.publish(id, &result);
        result
    }

    async fn run_pass(&self, id: &ProviderId) -> Result<SyncOutcome> {
        let slot = self.slot(id).await?;
        let _pass = slot.pass.lock().await;
        let adapter = slot.adapter.as_ref();

        let remote = self
            .retry
            .run("pull", || adapter.pull())
            .await
            .map_err(|e| SyncError::provider(id, e))?;
        let Some(remote) = remote else {
            tracing::info!("Provider {} is empty, uploading local data", id);
            return self.push_local(id, adapter, None, SyncOutcome::InitialPush).await;
        };
        let payload = RemotePayload::decode(&remote.data)?;
        // Read before the clock: a save after this point cancels a pull
        let last_local_change = self.gateway.last_local_change().await;

        // A new revision always counts as a remote change, even if the
        // other device's clock is behind ours
        let rev = remote.rev.as_str().to_string();
        let clock = self
            .gateway
            .update_sync_clock(id, |clock| {
                if clock.last_synced_rev.as_deref() != Some(rev.as_str()) {
                    clock.remote_changed_at = payload.last_change.max(clock.last_synced_at + 1);
                }
            })
            .await?;

        let status = reconcile(&clock, Some(&remote.rev));
        tracing::debug!("Provider {}: {} ({:?})", id, status, clock);
        match status {
            SyncStatus::InSync => Ok(SyncOutcome::InSync),
            SyncStatus::LocalUpdateRequired => {
                self.pull_remote(id, payload, remote.rev, clock.remote_changed_at, Some(last_local_change))
                    .await
            }
            SyncStatus::RemoteUpdateRequired => {
                self.push_local(id, adapter, Some(&remote.rev), SyncOutcome::Pushed)
                    .await
            }
            SyncStatus::DataDiverged => {
                tracing::warn!(
                    "Local and remote data of {} both changed since last sync, manual resolution required",
                    id
                );
                Ok(SyncOutcome::Diverged(ConflictInfo::new(
                    id,
                    ConflictReason::BothChanged,
                    &clock,
                    Some(remote.rev),
                )))
            }
            SyncStatus::LastSyncNotUpToDate => {
                self.gateway
                    .update_sync_clock(id, |c| {
                        c.mark_synced(c.local_changed_at, c.remote_changed_at, Some(rev.clone()))
                    })
                    .await?;
                Ok(SyncOutcome::BookkeepingOnly)
            }
        }
    }

    async fn run_resolution(&self, id: &ProviderId, resolution: Resolution) -> Result<SyncOutcome> {
        let slot = self.slot(id).await?;
        let _pass = slot.pass.lock().await;
        let adapter = slot.adapter.as_ref();

        let remote = self
            .retry
            .run("pull", || adapter.pull())
            .await
            .map_err(|e| SyncError::provider(id, e))?;
        tracing::info!("Resolving conflict with {}: {:?}", id, resolution);
        match (resolution, remote) {
            (Resolution::UseLocal, remote) => {
                let expected = remote.map(|r| r.rev);
                self.push_local(id, adapter, expected.as_ref(), SyncOutcome::Pushed)
                    .await
            }
            (Resolution::UseRemote, Some(remote)) => {
                let payload = RemotePayload::decode(&remote.data)?;
                let remote_changed_at = payload.last_change;
                self.pull_remote(id, payload, remote.rev, remote_changed_at, None)
                    .await
            }
            (Resolution::UseRemote, None) => Err(SyncError::RemoteEmpty(id.clone())),
        }
    }

    /// Imports the remote data and records both sides as synced. With
    /// `unless_changed_since`, a local save after that stamp turns the pull
    /// into a divergence instead of overwriting the save.
    async fn pull_remote(
        &self,
        id: &ProviderId,
        payload: RemotePayload,
        rev: RevisionToken,
        remote_changed_at: i64,
        unless_changed_since: Option<i64>,
    ) -> Result<SyncOutcome> {
        let imported = match unless_changed_since {
            Some(stamp) => match self.gateway.import_if_unchanged(payload.data, stamp).await? {
                Some(imported) => imported,
                None => {
                    tracing::warn!("Local data of {} changed during pull, manual resolution required", id);
                    let clock = self.gateway.sync_clock(id).await?;
                    return Ok(SyncOutcome::Diverged(ConflictInfo::new(
                        id,
                        ConflictReason::BothChanged,
                        &clock,
                        Some(rev),
                    )));
                }
            },
            None => self.gateway.import_complete(payload.data).await?,
        };
        self.gateway
            .update_sync_clock(id, |c| {
                c.mark_synced(imported.changed_at, remote_changed_at, Some(rev.into()))
            })
            .await?;
        Ok(SyncOutcome::Pulled)
    }

    /// Uploads the local data on top of `expected`.
    async fn push_local(
        &self,
        id: &ProviderId,
        adapter: &dyn ProviderAdapter,
        expected: Option<&RevisionToken>,
        outcome: SyncOutcome,
    ) -> Result<SyncOutcome> {
        // Read the stamp before the data: a save in between is pushed again
        // on the next pass instead of being marked as synced
        let changed_at = self.gateway.sync_clock(id).await?.local_changed_at;
        let snapshot = self.gateway.snapshot().await?;
        if let Err(e) = validate_app_data(&snapshot) {
            tracing::error!("Refusing to upload invalid data to {}: {}", id, e);
            return Err(StrataError::from(e).into());
        }
        let body = RemotePayload::new(changed_at, snapshot.as_ref().clone()).encode(self.compress)?;

        let pushed = match self.retry.run("push", || adapter.push(body.clone(), expected)).await {
            // A timed-out attempt may have been applied; its retry then
            // conflicts with our own write
            Err(ProviderError::Conflict { expected, actual }) => {
                match self.landed(id, adapter, &body).await? {
                    Some(rev) => {
                        tracing::info!("Earlier push to {} had been applied", id);
                        Ok(rev)
                    }
                    None => Err(ProviderError::Conflict { expected, actual }),
                }
            }
            other => other,
        };
        match pushed {
            Ok(rev) => {
                self.gateway
                    .update_sync_clock(id, |c| c.mark_synced(changed_at, changed_at, Some(rev.into())))
                    .await?;
                Ok(outcome)
            }
            Err(ProviderError::Conflict { actual, .. }) => {
                tracing::warn!("Remote of {} changed while pushing, manual resolution required", id);
                let clock = self.gateway.sync_clock(id).await?;
                Ok(SyncOutcome::Diverged(ConflictInfo::new(
                    id,
                    ConflictReason::RemoteChangedDuringPush,
                    &clock,
                    actual,
                )))
            }
            Err(e) => Err(SyncError::provider(id, e)),
        }
    }

    /// Revision of the remote if it holds exactly `body`.
    async fn landed(
        &self,
        id: &ProviderId,
        adapter: &dyn ProviderAdapter,
        body: &Bytes,
    ) -> Result<Option<RevisionToken>> {
        let remote = self
            .retry
            .run("pull", || adapter.pull())
            .await
            .map_err(|e| SyncError::provider(id, e))?;
        Ok(remote.filter(|r| r.data == *body).map(|r| r.rev))
    }

    fn publish(&self, id: &ProviderId, result: &Result<SyncOutcome>) {
        let event = match result {
            Ok(outcome) => {
                tracing::info!("Sync with {}: {}", id, outcome);
                SyncEvent::Completed {
                    provider: id.clone(),
                    outcome: outcome.clone(),
                }
            }
            Err(e) => {
                let needs_user_action = e.needs_user_action();
                if needs_user_action {
                    tracing::error!("Sync with {} failed: {}", id, e);
                } else {
                    tracing::warn!("Sync with {} failed: {}", id, e);
                }
                SyncEvent::Failed {
                    provider: id.clone(),
                    error: e.to_string(),
                    needs_user_action,
                }
            }
        };
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SyncRunner for SyncEngine {
    async fn run(&self, provider: &ProviderId, trigger: SyncTrigger) {
        tracing::debug!("Sync pass for {} triggered by {:?}", provider, trigger);
        // Outcome and errors are logged and published by the engine
        let _ = self.sync_provider(provider).await;
    }
}
