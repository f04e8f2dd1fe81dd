//! Strata Sync Library
//!
//! Keeps the local replica in step with any number of remote providers:
//! - Reconciler deciding the sync direction from per-provider clocks
//! - Provider adapter contract with in-memory, local-file and HTTP adapters
//! - Payload envelope (checksum, optional zstd compression)
//! - Retry with bounded exponential backoff and rate-limit hints
//! - Sync engine running one pass per provider
//! - Trigger scheduler with debouncing and trailing re-runs
//! - Sync settings

pub mod error;
pub mod reconciler;
pub mod provider;
pub mod payload;
pub mod local_file;
pub mod http;
pub mod retry;
pub mod engine;
pub mod scheduler;
pub mod config;

pub use error::{ProviderError, ProviderResult, Result, SyncError};
pub use reconciler::{SyncStatus, classify, reconcile};
pub use provider::{MemoryProvider, ProviderAdapter, RemoteData, RevisionToken};
pub use payload::{PAYLOAD_MAGIC, RemotePayload, content_revision};
pub use local_file::LocalFileProvider;
pub use http::HttpProvider;
pub use retry::RetryPolicy;
pub use engine::{ConflictInfo, ConflictReason, Resolution, SyncEngine, SyncEvent, SyncOutcome};
pub use scheduler::{SchedulerSettings, SyncRunner, SyncTrigger, SyncTriggerScheduler, TriggerClass};
pub use config::{ProviderSettings, SyncSettings};
