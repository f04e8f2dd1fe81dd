//! Blob storage backends for the local replica
//!
//! Every entity kind is persisted as one JSON blob under a stable key. The
//! gateway only talks to the [`BlobStore`] trait; backends are chosen through
//! [`StoreConfig`].

use crate::error::{Result, StrataError};
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Key/value store of JSON blobs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load a blob; `None` if the key was never written
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Write a blob, replacing any previous value
    async fn save(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove a blob; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

// ─────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────

/// Volatile store, used in tests and as a scratch replica
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}

// ─────────────────────────────────────────────────────
// File per blob
// ─────────────────────────────────────────────────────

const ENCODED_KEY_PREFIX: char = '~';

/// One `<key>.json` file per blob, written atomically via tmp + rename
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open or create a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys made of `[A-Za-z0-9_-]` are used as file names directly, any
    /// other key is hex-encoded behind a `~`.
    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StrataError::Backend("Empty blob key".to_string()));
        }
        let is_plain = key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let name = if is_plain {
            format!("{}.json", key)
        } else {
            format!("{}{}.json", ENCODED_KEY_PREFIX, hex::encode(key))
        };
        Ok(self.root.join(name))
    }
}

fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".json")?;
    match stem.strip_prefix(ENCODED_KEY_PREFIX) {
        Some(encoded) => String::from_utf8(hex::decode(encoded).ok()?).ok(),
        None => Some(stem.to_string()),
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.blob_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.blob_path(key)?;
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec(value)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(key_from_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ─────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────

/// Single-table SQLite store in WAL mode
pub struct SqliteBlobStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteBlobStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Self::init(conn)
    }

    /// In-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StrataError::Database("connection mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StrataError::Backend(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        let text: Option<String> = self
            .with_conn(move |conn| {
                let text = conn
                    .query_row("SELECT value FROM blobs WHERE key = ?1", [&key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(text)
            })
            .await?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        let key = key.to_string();
        let text = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO blobs (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [&key, &text],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM blobs WHERE key = ?1", [&key])?;
            Ok(())
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT key FROM blobs ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────

/// Which backend holds the local replica, stored as `store.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File {
        #[serde(default = "default_blob_dir")]
        dir: PathBuf,
    },
    Sqlite {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("blobs")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("strata.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: default_db_path(),
        }
    }
}

impl StoreConfig {
    const FILE_NAME: &'static str = "store.json";

    /// Load `store.json` from `dir`, or the default config if there is none
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(Self::FILE_NAME);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Open the configured backend. Relative paths resolve against `base`.
    pub fn open(&self, base: &Path) -> Result<Arc<dyn BlobStore>> {
        let store: Arc<dyn BlobStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryBlobStore::new()),
            StoreConfig::File { dir } => Arc::new(FileBlobStore::open(base.join(dir))?),
            StoreConfig::Sqlite { path } => Arc::new(SqliteBlobStore::open(&base.join(path))?),
        };
        tracing::debug!("Opened blob store {:?} under {}", self, base.display());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn exercise(store: &dyn BlobStore) {
        assert_eq!(store.load("task").await.unwrap(), None);
        store.save("task", &json!({"ids": []})).await.unwrap();
        store.save("project", &json!({"ids": ["P1"]})).await.unwrap();
        store.save("task", &json!({"ids": ["t1"]})).await.unwrap();
        assert_eq!(store.load("task").await.unwrap(), Some(json!({"ids": ["t1"]})));
        assert_eq!(store.keys().await.unwrap(), vec!["project", "task"]);
        store.remove("task").await.unwrap();
        store.remove("task").await.unwrap();
        assert_eq!(store.load("task").await.unwrap(), None);
        store.remove("project").await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryBlobStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let tmp = TempDir::new().unwrap();
        let store = FileBlobStore::open(tmp.path().join("blobs")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_encodes_unusual_keys() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("blobs");
        let store = FileBlobStore::open(&root).unwrap();
        store.save("../escape", &json!(1)).await.unwrap();
        store.save("p__a/b__note", &json!(2)).await.unwrap();
        store.save("task", &json!(3)).await.unwrap();
        assert!(!tmp.path().join("escape.json").exists());
        assert!(root.join("task.json").exists());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 3);

        assert_eq!(store.load("p__a/b__note").await.unwrap(), Some(json!(2)));
        assert_eq!(store.keys().await.unwrap(), vec!["../escape", "p__a/b__note", "task"]);
        store.remove("../escape").await.unwrap();
        assert_eq!(store.load("../escape").await.unwrap(), None);
        assert!(store.save("", &json!(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteBlobStore::open(&tmp.path().join("db/strata.db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("strata.db");
        {
            let store = SqliteBlobStore::open(&path).unwrap();
            store.save("tag", &json!({"ids": ["x"]})).await.unwrap();
        }
        let store = SqliteBlobStore::open(&path).unwrap();
        assert_eq!(store.load("tag").await.unwrap(), Some(json!({"ids": ["x"]})));
    }

    #[test]
    fn test_store_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap(), StoreConfig::default());
        let cfg = StoreConfig::File { dir: "data".into() };
        cfg.save(tmp.path()).unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap(), cfg);
        let raw = fs::read_to_string(tmp.path().join("store.json")).unwrap();
        assert!(raw.contains("\"backend\": \"file\""));
    }

    #[tokio::test]
    async fn test_store_config_open() {
        let tmp = TempDir::new().unwrap();
        let store = StoreConfig::File { dir: "b".into() }.open(tmp.path()).unwrap();
        store.save("k", &json!(true)).await.unwrap();
        assert!(tmp.path().join("b/k.json").exists());
    }
}
