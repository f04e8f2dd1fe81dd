//! Provider backed by a single file, e.g. inside a folder that a cloud drive
//! client mirrors. The revision token is the SHA-256 of the file content.

use crate::error::{ProviderError, ProviderResult};
use crate::payload::content_revision;
use crate::provider::{ProviderAdapter, RemoteData, RevisionToken};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use strata_core::ProviderId;
use tokio::sync::Mutex;

pub struct LocalFileProvider {
    id: ProviderId,
    path: PathBuf,
    /// Serializes read-compare-write within this process.
    write_lock: Mutex<()>,
}

impl LocalFileProvider {
    pub fn new(id: impl Into<ProviderId>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> ProviderResult<Option<RemoteData>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                let rev = RevisionToken::new(content_revision(&data));
                Ok(Some(RemoteData {
                    data: Bytes::from(data),
                    rev,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalFileProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn pull(&self) -> ProviderResult<Option<RemoteData>> {
        self.read().await
    }

    async fn push(&self, data: Bytes, expected: Option<&RevisionToken>) -> ProviderResult<RevisionToken> {
        let _guard = self.write_lock.lock().await;
        let actual = self.read().await?.map(|d| d.rev);
        if actual.as_ref() != expected {
            return Err(ProviderError::Conflict {
                expected: expected.cloned(),
                actual,
            });
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        tracing::debug!("Wrote {} bytes to {}", data.len(), self.path.display());
        Ok(RevisionToken::new(content_revision(&data)))
    }
}
