//! Persistence gateway
//!
//! The only component that reads and writes the local replica and the only
//! one allowed to run migrations. Loading is all-or-nothing: every kind is
//! read, version-checked and migrated in memory before anything is written
//! back. Saves are refused while the import lock is held.

use crate::clock::{ProviderId, SyncClock, SyncClocks, now_millis};
use crate::collection::{AppSnapshot, EntityCollection, ModelData, Singleton};
use crate::cross_model::{CrossModelContext, CrossModelMigrator, LEGACY_DEFAULT_PROJECT_ID};
use crate::error::{Result, StrataError};
use crate::kind::EntityKind;
use crate::lock::{ImportGuard, ImportLock};
use crate::migrate::{default_global_config, migrate_entities, migrate_value};
use crate::report::MigrationReport;
use crate::shard::LegacyShards;
use crate::store::{BlobStore, StoreConfig};
use crate::validate::validate_app_data;
use crate::version::{SchemaVersion, VersionCheck, check, current_version};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};

/// Per-provider sync clocks.
pub const SYNC_CLOCKS_KEY: &str = "__syncClocks";
/// Snapshot taken before the last import.
pub const BACKUP_KEY: &str = "__backup";
/// Time of the last save, in milliseconds.
pub const LAST_ACTIVE_KEY: &str = "__lastActive";
/// Time of the last change to the model data, in milliseconds.
pub const LAST_LOCAL_CHANGE_KEY: &str = "__lastLocalChange";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// The save is part of an import holding the import lock.
    pub is_import: bool,
}

impl SaveOptions {
    pub fn import() -> Self {
        Self { is_import: true }
    }
}

/// Broadcast after every non-import save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalChange {
    pub kind: EntityKind,
    pub changed_at: i64,
}

#[derive(Debug, Default)]
struct Meta {
    clocks: SyncClocks,
    last_local_change: i64,
}

/// Outcome of [`PersistenceGateway::import_complete`].
#[derive(Debug, Clone)]
pub struct Imported {
    pub snapshot: Arc<AppSnapshot>,
    /// Local change stamp recorded for the import.
    pub changed_at: i64,
}

/// Result of running every migration over a snapshot.
struct Prepared {
    snapshot: AppSnapshot,
    report: MigrationReport,
    consolidated: Vec<EntityKind>,
}

pub struct PersistenceGateway {
    store: Arc<dyn BlobStore>,
    snapshot: RwLock<Option<Arc<AppSnapshot>>>,
    meta: Mutex<Meta>,
    /// Serializes blob writes.
    writes: Mutex<()>,
    import_lock: ImportLock,
    changes: broadcast::Sender<LocalChange>,
    cross_model: CrossModelMigrator,
    report: RwLock<MigrationReport>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            snapshot: RwLock::new(None),
            meta: Mutex::new(Meta::default()),
            writes: Mutex::new(()),
            import_lock: ImportLock::new(),
            changes,
            cross_model: CrossModelMigrator::new(),
            report: RwLock::new(MigrationReport::default()),
        }
    }

    /// Opens the store configured in `dir/store.json`.
    pub fn open(dir: &Path) -> Result<Self> {
        let store = StoreConfig::load(dir)?.open(dir)?;
        Ok(Self::new(store))
    }

    pub fn with_cross_model_migrator(mut self, migrator: CrossModelMigrator) -> Self {
        self.cross_model = migrator;
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    // ── Load ──

    /// Reads every kind, migrates what is stale and installs the result.
    ///
    /// Fails with [`StrataError::MigrationVersionTooNew`] before anything is
    /// written if any kind (or legacy shard) was written by a newer major
    /// version.
    pub async fn load(&self) -> Result<Arc<AppSnapshot>> {
        let _guard = self.import_lock.acquire()?;
        let _writes = self.writes.lock().await;

        let mut raw: BTreeMap<EntityKind, Value> = BTreeMap::new();
        let mut loaded = AppSnapshot::default();
        for kind in EntityKind::ALL {
            if let Some(value) = self.store.load(kind.key()).await? {
                parse_kind(&mut loaded, kind, value.clone())?;
                raw.insert(kind, value);
            }
        }
        loaded.last_active_time = self
            .store
            .load(LAST_ACTIVE_KEY)
            .await?
            .and_then(|v| v.as_i64());

        let (shards, shard_keys) = self.load_legacy_shards(&loaded).await?;
        let issue_provider_blob_exists = raw.contains_key(&EntityKind::IssueProvider);

        let prepared = self.prepare(loaded, shards, issue_provider_blob_exists)?;

        for kind in EntityKind::ALL {
            let Some(json) = prepared.snapshot.kind_to_json(kind) else {
                continue;
            };
            if raw.get(&kind) != Some(&json) {
                self.store.save(kind.key(), &json).await?;
            }
        }
        for kind in &prepared.consolidated {
            for key in shard_keys.get(kind).into_iter().flatten() {
                self.store.remove(key).await?;
            }
            tracing::info!("Removed legacy {} shards after consolidation", kind);
        }

        let clocks: SyncClocks = match self.store.load(SYNC_CLOCKS_KEY).await? {
            Some(v) => serde_json::from_value(v)?,
            None => SyncClocks::default(),
        };
        let last_local_change = self
            .store
            .load(LAST_LOCAL_CHANGE_KEY)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        *self.meta.lock().await = Meta {
            clocks,
            last_local_change,
        };

        let snapshot = Arc::new(prepared.snapshot);
        *self.snapshot.write().await = Some(Arc::clone(&snapshot));
        if !prepared.report.is_empty() {
            tracing::info!(
                "Load migrated {} kinds ({} ambiguous decisions)",
                prepared.report.records.len(),
                prepared.report.ambiguous.len()
            );
        }
        *self.report.write().await = prepared.report;
        Ok(snapshot)
    }

    async fn load_legacy_shards(
        &self,
        loaded: &AppSnapshot,
    ) -> Result<(BTreeMap<EntityKind, LegacyShards>, BTreeMap<EntityKind, Vec<String>>)> {
        let mut project_ids: Vec<&str> = loaded
            .collection(EntityKind::Project)
            .map(|p| p.ids.iter().map(String::as_str).collect())
            .unwrap_or_default();
        if !project_ids.contains(&LEGACY_DEFAULT_PROJECT_ID) {
            project_ids.push(LEGACY_DEFAULT_PROJECT_ID);
        }

        let mut shards: BTreeMap<EntityKind, LegacyShards> = BTreeMap::new();
        let mut keys: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();
        for kind in EntityKind::SHARDED_LEGACY {
            for pid in &project_ids {
                let key = kind.legacy_shard_key(pid);
                let Some(value) = self.store.load(&key).await? else {
                    continue;
                };
                let shard = EntityCollection::from_json(value).map_err(|reason| {
                    StrataError::InvalidData {
                        kind,
                        reason: format!("legacy shard {}: {}", key, reason),
                    }
                })?;
                tracing::debug!("Found legacy shard {} with {} entities", key, shard.len());
                shards.entry(kind).or_default().insert(pid.to_string(), shard);
                keys.entry(kind).or_default().push(key);
            }
        }
        Ok((shards, keys))
    }

    /// Version-checks and migrates a snapshot in memory, then fills in missing
    /// kinds and stamps every kind with its current version.
    fn prepare(
        &self,
        mut snapshot: AppSnapshot,
        mut shards: BTreeMap<EntityKind, LegacyShards>,
        issue_provider_blob_exists: bool,
    ) -> Result<Prepared> {
        for kind in EntityKind::ALL {
            ensure_supported(kind, snapshot.schema_version(kind))?;
        }
        for (kind, kind_shards) in &shards {
            for shard in kind_shards.values() {
                ensure_supported(*kind, shard.schema_version)?;
            }
        }

        let mut report = MigrationReport::default();
        for kind in EntityKind::ALL {
            let loaded = snapshot.schema_version(kind);
            let verdict = check(kind, loaded);
            if verdict == VersionCheck::NewerMinor {
                tracing::warn!(
                    "'{}' v{} is newer than supported v{}, loading it as-is",
                    kind,
                    loaded.map_or(0.0, SchemaVersion::value),
                    current_version(kind)
                );
            }
            if !verdict.needs_migration() {
                continue;
            }
            if kind.is_singleton() {
                if let Some(singleton) = snapshot.singletons.get_mut(&kind) {
                    report.push(migrate_value(kind, &mut singleton.value, loaded));
                }
            } else if let Some(collection) = snapshot.collections.get_mut(&kind) {
                report.push(migrate_entities(kind, collection, loaded));
            }
        }
        for (kind, kind_shards) in shards.iter_mut() {
            for (pid, shard) in kind_shards.iter_mut() {
                let loaded = shard.schema_version;
                if check(*kind, loaded).needs_migration() {
                    let mut record = migrate_entities(*kind, shard, loaded);
                    record.name = format!("{} (shard {})", record.name, pid);
                    report.push(record);
                }
            }
        }

        let out = self.cross_model.migrate(
            snapshot,
            CrossModelContext {
                issue_provider_blob_exists,
                legacy_shards: shards,
            },
        );
        report.records.extend(out.report.records);
        report.ambiguous.extend(out.report.ambiguous);

        let mut snapshot = out.snapshot;
        fill_and_stamp(&mut snapshot);
        Ok(Prepared {
            snapshot,
            report,
            consolidated: out.consolidated,
        })
    }

    // ── Save ──

    /// Persists one kind and records the change on every provider's clock.
    ///
    /// Refused with [`StrataError::ImportInProgress`] while the import lock is
    /// held, unless `opts.is_import` is set.
    pub async fn save(&self, kind: EntityKind, data: ModelData, opts: SaveOptions) -> Result<()> {
        let generation = self.import_lock.generation();
        if !opts.is_import && self.import_lock.is_held() {
            tracing::warn!("Blocked save of '{}' while a data import is running", kind);
            return Err(StrataError::ImportInProgress(kind));
        }
        let _writes = self.writes.lock().await;
        // An import may have started (and even finished) while we waited.
        if !opts.is_import
            && (self.import_lock.is_held() || self.import_lock.generation() != generation)
        {
            tracing::warn!("Dropped save of '{}' that raced a data import", kind);
            return Err(StrataError::ImportInProgress(kind));
        }

        let stored = self.snapshot().await?.schema_version(kind);
        let json = match (kind.is_singleton(), data) {
            (false, ModelData::Collection(mut collection)) => {
                let stamp = save_stamp(kind, stored, collection.schema_version)?;
                let fix = collection.fix_consistency();
                if !fix.is_clean() {
                    tracing::warn!("Repaired inconsistent '{}' collection on save: {:?}", kind, fix);
                }
                collection.schema_version = Some(stamp);
                let json = collection.to_json();
                self.store.save(kind.key(), &json).await?;
                self.install(|snap| {
                    snap.collections.insert(kind, collection);
                })
                .await?;
                json
            }
            (true, ModelData::Singleton(value)) => {
                let singleton = Singleton::new(value, Some(save_stamp(kind, stored, None)?));
                let json = singleton.to_json();
                self.store.save(kind.key(), &json).await?;
                self.install(|snap| {
                    snap.singletons.insert(kind, singleton);
                })
                .await?;
                json
            }
            (is_singleton, _) => {
                return Err(StrataError::InvalidData {
                    kind,
                    reason: if is_singleton {
                        "expected a single value".to_string()
                    } else {
                        "expected an entity collection".to_string()
                    },
                });
            }
        };
        tracing::debug!("Saved '{}' ({} bytes)", kind, json.to_string().len());

        let changed_at = self.record_local_change().await?;
        if !opts.is_import {
            // No receivers is fine: sync may be disabled.
            let _ = self.changes.send(LocalChange { kind, changed_at });
        }
        Ok(())
    }

    /// Applies `f` to a private copy of the installed snapshot.
    async fn install(&self, f: impl FnOnce(&mut AppSnapshot)) -> Result<()> {
        let mut guard = self.snapshot.write().await;
        let snap = guard.as_mut().ok_or(StrataError::NotLoaded)?;
        let snap = Arc::make_mut(snap);
        f(snap);
        snap.last_active_time = Some(now_millis());
        Ok(())
    }

    /// Advances the local change time and every provider's `localChangedAt`.
    async fn record_local_change(&self) -> Result<i64> {
        let now = now_millis();
        let mut guard = self.meta.lock().await;
        let meta = &mut *guard;
        meta.last_local_change = meta
            .clocks
            .touch_local_all(now.max(meta.last_local_change + 1));
        self.store
            .save(LAST_LOCAL_CHANGE_KEY, &Value::from(meta.last_local_change))
            .await?;
        self.store.save(LAST_ACTIVE_KEY, &Value::from(now)).await?;
        self.store
            .save(SYNC_CLOCKS_KEY, &serde_json::to_value(&meta.clocks)?)
            .await?;
        Ok(meta.last_local_change)
    }

    // ── Import ──

    /// Runs `f` while holding the import lock. Ordinary saves are refused
    /// until `f` completes, fails or panics.
    pub async fn with_import_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.import_lock.acquire()?;
        f().await
    }

    /// Takes the import lock until the returned guard is dropped.
    pub fn begin_import(&self) -> Result<ImportGuard> {
        self.import_lock.acquire()
    }

    pub fn is_import_in_progress(&self) -> bool {
        self.import_lock.is_held()
    }

    /// Replaces the whole dataset with `incoming`.
    ///
    /// The incoming data is version-checked and migrated first; a newer major
    /// version aborts before anything is written. The current snapshot is
    /// saved as a backup and written back if the import fails midway.
    pub async fn import_complete(&self, incoming: AppSnapshot) -> Result<Imported> {
        let _guard = self.import_lock.acquire()?;
        let _writes = self.writes.lock().await;
        self.import_locked(incoming).await
    }

    /// Like [`import_complete`](Self::import_complete), but only if no local
    /// change was recorded after `last_local_change`. Returns `None` and
    /// leaves everything untouched otherwise.
    pub async fn import_if_unchanged(
        &self,
        incoming: AppSnapshot,
        last_local_change: i64,
    ) -> Result<Option<Imported>> {
        let _guard = self.import_lock.acquire()?;
        let _writes = self.writes.lock().await;
        let current = self.meta.lock().await.last_local_change;
        if current != last_local_change {
            tracing::info!("Local data changed since {}, import skipped", last_local_change);
            return Ok(None);
        }
        self.import_locked(incoming).await.map(Some)
    }

    /// Import body; the caller holds the import lock and the write lock.
    async fn import_locked(&self, incoming: AppSnapshot) -> Result<Imported> {
        let issue_provider_blob_exists = incoming.collection(EntityKind::IssueProvider).is_some();
        let mut prepared = self.prepare(incoming, BTreeMap::new(), issue_provider_blob_exists)?;
        if prepared.snapshot.last_active_time.is_none() {
            prepared.snapshot.last_active_time = Some(now_millis());
        }
        if let Err(e) = validate_app_data(&prepared.snapshot) {
            tracing::error!("Refusing to import invalid data: {}", e);
            return Err(e.into());
        }

        let previous = self.snapshot.read().await.clone();
        if let Some(previous) = &previous {
            self.store.save(BACKUP_KEY, &previous.to_json()).await?;
        }
        if let Err(e) = self.write_all(&prepared.snapshot).await {
            tracing::error!("Import failed while writing, restoring previous data: {}", e);
            if let Some(previous) = &previous {
                if let Err(restore) = self.write_all(previous).await {
                    tracing::error!("Restoring previous data failed: {}", restore);
                }
            }
            return Err(e);
        }

        let changed_at = self.record_local_change().await?;
        let snapshot = Arc::new(prepared.snapshot);
        *self.snapshot.write().await = Some(Arc::clone(&snapshot));
        *self.report.write().await = prepared.report;
        tracing::info!("Data import complete");
        Ok(Imported { snapshot, changed_at })
    }

    async fn write_all(&self, snapshot: &AppSnapshot) -> Result<()> {
        for kind in EntityKind::ALL {
            match snapshot.kind_to_json(kind) {
                Some(json) => self.store.save(kind.key(), &json).await?,
                None => self.store.remove(kind.key()).await?,
            }
        }
        if let Some(t) = snapshot.last_active_time {
            self.store.save(LAST_ACTIVE_KEY, &Value::from(t)).await?;
        }
        Ok(())
    }

    pub async fn load_backup(&self) -> Result<Option<AppSnapshot>> {
        match self.store.load(BACKUP_KEY).await? {
            Some(value) => AppSnapshot::from_json(value)
                .map(Some)
                .map_err(|e| StrataError::Backend(format!("Invalid backup: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn clear_backup(&self) -> Result<()> {
        self.store.remove(BACKUP_KEY).await
    }

    /// Discards all data and starts over from defaults. Provider
    /// registrations and the backup survive.
    pub async fn reset_all(&self) -> Result<Arc<AppSnapshot>> {
        let _guard = self.import_lock.acquire()?;
        let _writes = self.writes.lock().await;

        for key in self.store.keys().await? {
            if key != BACKUP_KEY && key != SYNC_CLOCKS_KEY {
                self.store.remove(&key).await?;
            }
        }
        let mut snapshot = AppSnapshot::default();
        fill_and_stamp(&mut snapshot);
        snapshot.last_active_time = Some(now_millis());
        self.write_all(&snapshot).await?;
        self.record_local_change().await?;

        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().await = Some(Arc::clone(&snapshot));
        *self.report.write().await = MigrationReport::default();
        tracing::warn!("All local data was reset");
        Ok(snapshot)
    }

    // ── Read access ──

    /// The current snapshot. Consumers get a shared immutable copy; later
    /// saves never change it.
    pub async fn snapshot(&self) -> Result<Arc<AppSnapshot>> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(StrataError::NotLoaded)
    }

    pub async fn is_loaded(&self) -> bool {
        self.snapshot.read().await.is_some()
    }

    /// Receives a [`LocalChange`] for every non-import save.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<LocalChange> {
        self.changes.subscribe()
    }

    /// Diagnostics of the last load or import.
    pub async fn last_migration_report(&self) -> MigrationReport {
        self.report.read().await.clone()
    }

    pub async fn last_local_change(&self) -> i64 {
        self.meta.lock().await.last_local_change
    }

    // ── Provider bookkeeping ──

    /// Creates a clock for a newly configured provider. Existing local data
    /// counts as changed for it. Returns false if it was already registered.
    pub async fn register_provider(&self, id: ProviderId) -> Result<bool> {
        let mut meta = self.meta.lock().await;
        if !meta.clocks.register(id.clone()) {
            return Ok(false);
        }
        let last_local_change = meta.last_local_change;
        if let Some(clock) = meta.clocks.get_mut(&id) {
            clock.local_changed_at = last_local_change;
        }
        self.store
            .save(SYNC_CLOCKS_KEY, &serde_json::to_value(&meta.clocks)?)
            .await?;
        tracing::info!("Registered sync provider {}", id);
        Ok(true)
    }

    pub async fn remove_provider(&self, id: &ProviderId) -> Result<bool> {
        let mut meta = self.meta.lock().await;
        if meta.clocks.remove(id).is_none() {
            return Ok(false);
        }
        self.store
            .save(SYNC_CLOCKS_KEY, &serde_json::to_value(&meta.clocks)?)
            .await?;
        Ok(true)
    }

    pub async fn provider_ids(&self) -> Vec<ProviderId> {
        self.meta.lock().await.clocks.ids().cloned().collect()
    }

    pub async fn sync_clock(&self, id: &ProviderId) -> Result<SyncClock> {
        self.meta
            .lock()
            .await
            .clocks
            .get(id)
            .cloned()
            .ok_or_else(|| StrataError::UnknownProvider(id.to_string()))
    }

    /// Updates one provider's clock and persists it.
    pub async fn update_sync_clock(
        &self,
        id: &ProviderId,
        f: impl FnOnce(&mut SyncClock),
    ) -> Result<SyncClock> {
        let mut guard = self.meta.lock().await;
        let meta = &mut *guard;
        let clock = meta
            .clocks
            .get_mut(id)
            .ok_or_else(|| StrataError::UnknownProvider(id.to_string()))?;
        f(clock);
        let updated = clock.clone();
        self.store
            .save(SYNC_CLOCKS_KEY, &serde_json::to_value(&meta.clocks)?)
            .await?;
        Ok(updated)
    }
}

fn parse_kind(snapshot: &mut AppSnapshot, kind: EntityKind, value: Value) -> Result<()> {
    if kind.is_singleton() {
        snapshot.singletons.insert(kind, Singleton::from_json(value));
    } else {
        let collection = EntityCollection::from_json(value)
            .map_err(|reason| StrataError::InvalidData { kind, reason })?;
        snapshot.collections.insert(kind, collection);
    }
    Ok(())
}

fn ensure_supported(kind: EntityKind, loaded: Option<SchemaVersion>) -> Result<()> {
    match (check(kind, loaded), loaded) {
        (VersionCheck::NewerMajor, Some(loaded)) => {
            tracing::error!(
                "'{}' v{} was written by a newer app version (supported v{})",
                kind,
                loaded,
                current_version(kind)
            );
            Err(StrataError::MigrationVersionTooNew {
                kind,
                loaded,
                current: current_version(kind),
            })
        }
        _ => Ok(()),
    }
}

/// Stamp for a save: never below what is stored, never below current.
fn save_stamp(
    kind: EntityKind,
    stored: Option<SchemaVersion>,
    incoming: Option<SchemaVersion>,
) -> Result<SchemaVersion> {
    ensure_supported(kind, incoming)?;
    let mut stamp = current_version(kind);
    for v in [stored, incoming].into_iter().flatten() {
        stamp = stamp.max(v);
    }
    Ok(stamp)
}

fn default_singleton(kind: EntityKind) -> Value {
    match kind {
        EntityKind::GlobalConfig => default_global_config(),
        _ => Value::Array(Vec::new()),
    }
}

/// Adds defaults for missing kinds and stamps every kind, keeping stamps
/// that are already newer.
fn fill_and_stamp(snapshot: &mut AppSnapshot) {
    for kind in EntityKind::ALL {
        let current = current_version(kind);
        let stamp = |loaded: Option<SchemaVersion>| Some(loaded.map_or(current, |v| v.max(current)));
        if kind.is_singleton() {
            let singleton = snapshot
                .singletons
                .entry(kind)
                .or_insert_with(|| Singleton::new(default_singleton(kind), None));
            singleton.schema_version = stamp(singleton.schema_version);
        } else {
            let collection = snapshot.collections.entry(kind).or_default();
            collection.schema_version = stamp(collection.schema_version);
        }
    }
}
