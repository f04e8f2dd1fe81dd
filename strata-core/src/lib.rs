//! Strata Core Library
//!
//! Local persistence layer of the task data, including:
//! - Entity kinds, collections and the aggregate snapshot
//! - Schema version registry
//! - Per-kind migration steps
//! - Legacy per-project shard merging
//! - Cross-model migrations (issue providers, orphan links, default project)
//! - Blob stores (memory, file-per-blob, SQLite in WAL mode)
//! - Integrity checks for whole datasets
//! - Persistence gateway with import lock and per-provider sync clocks

pub mod kind;
pub mod error;
pub mod version;
pub mod collection;
pub mod report;
pub mod migrate;
pub mod shard;
pub mod issue_provider;
pub mod cross_model;
pub mod clock;
pub mod store;
pub mod lock;
pub mod persistence;
pub mod validate;

pub use kind::EntityKind;
pub use error::{Result, StrataError};
pub use version::{SchemaVersion, VersionCheck, VERSION_FIELD, check, compare, current_version};
pub use collection::{AppSnapshot, ConsistencyFix, EntityCollection, ModelData, Singleton};
pub use report::{AmbiguousOutcome, MigrationRecord, MigrationReport};
pub use migrate::{MigrationStep, Migrated, migrate, migrate_entities, migrate_value, pending_steps, steps_for};
pub use shard::{LegacyShardMerger, LegacyShards, ShardMerge, merge_shards};
pub use issue_provider::IssueProviderKind;
pub use cross_model::{CrossModelContext, CrossModelMigrator, CrossModelOutcome, CrossModelStep};
pub use clock::{ProviderId, SyncClock, SyncClocks, now_millis};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore, SqliteBlobStore, StoreConfig};
pub use lock::{ImportGuard, ImportLock};
pub use persistence::{Imported, LocalChange, PersistenceGateway, SaveOptions};
pub use validate::{IntegrityError, validate_app_data};
