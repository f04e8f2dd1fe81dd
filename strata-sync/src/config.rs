//! Sync settings stored at `<data dir>/sync.json`.

use crate::engine::SyncEngine;
use crate::http::HttpProvider;
use crate::local_file::LocalFileProvider;
use crate::provider::ProviderAdapter;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerSettings, SyncRunner, SyncTriggerScheduler};
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{PersistenceGateway, ProviderId};

/// One configured remote replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSettings {
    /// A file, typically inside a folder mirrored by a cloud drive client.
    /// Relative paths are resolved against the data directory.
    LocalFile { id: ProviderId, path: PathBuf },
    /// A sync server storing the payload under `url`
    Http {
        id: ProviderId,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl ProviderSettings {
    pub fn id(&self) -> &ProviderId {
        match self {
            ProviderSettings::LocalFile { id, .. } | ProviderSettings::Http { id, .. } => id,
        }
    }

    /// Creates the adapter. `timeout` bounds single HTTP requests.
    pub fn build(&self, base: &Path, timeout: Duration) -> Result<Arc<dyn ProviderAdapter>> {
        let adapter: Arc<dyn ProviderAdapter> = match self {
            ProviderSettings::LocalFile { id, path } => {
                Arc::new(LocalFileProvider::new(id.clone(), base.join(path)))
            }
            ProviderSettings::Http { id, url, token } => {
                let provider = HttpProvider::new(id.clone(), url, timeout)
                    .with_context(|| format!("Failed to set up provider {}", id))?;
                match token {
                    Some(token) => Arc::new(provider.with_token(token.clone())),
                    None => Arc::new(provider),
                }
            }
        };
        Ok(adapter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Automatic syncing. Explicit engine calls run regardless.
    pub enabled: bool,
    /// zstd-compress uploaded payloads
    pub compress: bool,
    pub scheduler: SchedulerSettings,
    pub retry: RetryPolicy,
    pub providers: Vec<ProviderSettings>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            compress: true,
            scheduler: SchedulerSettings::default(),
            retry: RetryPolicy::default(),
            providers: Vec::new(),
        }
    }
}

impl SyncSettings {
    pub const FILE_NAME: &'static str = "sync.json";

    /// Load settings from a data directory; defaults if the file is missing.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read sync settings from {:?}", path))?;
        let settings: SyncSettings =
            serde_json::from_str(&data).with_context(|| "Failed to parse sync settings JSON")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a data directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for provider in &self.providers {
            let id = provider.id();
            if id.as_str().is_empty() {
                bail!("Sync provider with empty id");
            }
            if !seen.insert(id) {
                bail!("Duplicate sync provider id '{}'", id);
            }
        }
        if self.scheduler.max_wait < self.scheduler.debounce {
            return Err(anyhow!(
                "max_wait ({}ms) must not be shorter than debounce ({}ms)",
                self.scheduler.max_wait.as_millis(),
                self.scheduler.debounce.as_millis()
            ));
        }
        Ok(())
    }

    pub fn build_providers(&self, base: &Path) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
        self.providers
            .iter()
            .map(|p| p.build(base, self.retry.timeout))
            .collect()
    }

    /// Creates an engine with every configured provider registered.
    pub async fn build_engine(&self, gateway: Arc<PersistenceGateway>, base: &Path) -> Result<SyncEngine> {
        let engine = SyncEngine::new(gateway)
            .with_retry_policy(self.retry.clone())
            .with_compression(self.compress);
        for adapter in self.build_providers(base)? {
            let id = adapter.id().clone();
            engine
                .add_provider(adapter)
                .await
                .with_context(|| format!("Failed to register sync provider {}", id))?;
        }
        Ok(engine)
    }

    /// Starts the trigger scheduler for every provider of `engine`, or
    /// nothing if automatic syncing is disabled.
    pub async fn start_scheduler(&self, engine: &Arc<SyncEngine>) -> Option<SyncTriggerScheduler> {
        if !self.enabled {
            tracing::info!("Automatic sync is disabled");
            return None;
        }
        let providers = engine.provider_ids().await;
        Some(SyncTriggerScheduler::start(
            Arc::clone(engine) as Arc<dyn SyncRunner>,
            providers,
            self.scheduler.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::MemoryBlobStore;
    use tempfile::TempDir;

    fn sample() -> SyncSettings {
        SyncSettings {
            providers: vec![
                ProviderSettings::LocalFile {
                    id: "drive".into(),
                    path: PathBuf::from("drive/strata.bin"),
                },
                ProviderSettings::Http {
                    id: "server".into(),
                    url: "https://sync.example.com/u/42".to_string(),
                    token: Some("secret".to_string()),
                },
            ],
            ..SyncSettings::default()
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = SyncSettings::load(tmp.path()).unwrap();
        assert_eq!(settings, SyncSettings::default());
        assert!(settings.providers.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let settings = sample();
        settings.save(tmp.path()).unwrap();
        assert!(tmp.path().join("sync.json").exists());
        assert!(!tmp.path().join("sync.tmp").exists());
        assert_eq!(SyncSettings::load(tmp.path()).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("sync.json"),
            r#"{
                "compress": false,
                "scheduler": {"debounce": 500},
                "providers": [{"type": "local_file", "id": "usb", "path": "/mnt/usb/strata.bin"}]
            }"#,
        )
        .unwrap();
        let settings = SyncSettings::load(tmp.path()).unwrap();
        assert!(settings.enabled);
        assert!(!settings.compress);
        assert_eq!(settings.scheduler.debounce, Duration::from_millis(500));
        assert_eq!(settings.scheduler.max_wait, SchedulerSettings::default().max_wait);
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.providers[0].id().as_str(), "usb");
    }

    #[test]
    fn test_duplicate_provider_ids_are_rejected() {
        let mut settings = sample();
        settings.providers.push(ProviderSettings::LocalFile {
            id: "drive".into(),
            path: PathBuf::from("other.bin"),
        });
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));

        let tmp = TempDir::new().unwrap();
        assert!(settings.save(tmp.path()).is_err());
        assert!(!tmp.path().join("sync.json").exists());
    }

    #[test]
    fn test_invalid_json_has_context() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("sync.json"), "{ not json").unwrap();
        let err = SyncSettings::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse sync settings"));
    }

    #[tokio::test]
    async fn test_build_engine_registers_providers() {
        let tmp = TempDir::new().unwrap();
        let gateway = Arc::new(PersistenceGateway::new(Arc::new(MemoryBlobStore::new())));
        gateway.load().await.unwrap();
        let engine = sample().build_engine(Arc::clone(&gateway), tmp.path()).await.unwrap();

        let ids: Vec<String> = engine.provider_ids().await.iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["drive", "server"]);
        assert_eq!(gateway.provider_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_sync_starts_no_scheduler() {
        let tmp = TempDir::new().unwrap();
        let gateway = Arc::new(PersistenceGateway::new(Arc::new(MemoryBlobStore::new())));
        gateway.load().await.unwrap();
        let settings = SyncSettings {
            enabled: false,
            ..sample()
        };
        let engine = Arc::new(settings.build_engine(gateway, tmp.path()).await.unwrap());
        assert!(settings.start_scheduler(&engine).await.is_none());

        let enabled = SyncSettings { enabled: true, ..settings };
        let scheduler = enabled.start_scheduler(&engine).await.unwrap();
        assert_eq!(scheduler.providers().count(), 2);
        scheduler.shutdown().await;
    }
}
