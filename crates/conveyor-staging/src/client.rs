use crate::handle::HandleSigner;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conveyor_core::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// A time-limited handle for one out-of-band upload or download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingHandle {
    /// Object key the handle grants access to.
    pub key: String,
    /// Opaque signed token presented by the client.
    pub token: String,
    /// When the handle stops working.
    pub expires_at: DateTime<Utc>,
}

/// External object storage for input and output artifacts.
///
/// Keys are `/`-separated paths; a prefix always ends with `/` and covers
/// every key below it.
#[async_trait]
pub trait StagingClient: Send + Sync {
    /// Issue a time-limited upload handle for `key`.
    async fn issue_upload_handle(&self, key: &str, ttl: Duration) -> ConveyorResult<StagingHandle>;

    /// Issue a time-limited download handle for `key`.
    async fn issue_download_handle(&self, key: &str, ttl: Duration)
        -> ConveyorResult<StagingHandle>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> ConveyorResult<bool>;

    /// Read the object at `key`.
    async fn read(&self, key: &str) -> ConveyorResult<Vec<u8>>;

    /// Write `bytes` to `key`, returning the stored size.
    async fn write(&self, key: &str, bytes: &[u8]) -> ConveyorResult<u64>;

    /// Size of the object at `key`.
    async fn size(&self, key: &str) -> ConveyorResult<u64>;

    /// Delete every object under `prefix`, returning how many went away.
    async fn delete_by_prefix(&self, prefix: &str) -> ConveyorResult<u64>;
}

fn validate_key(key: &str) -> ConveyorResult<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(ConveyorError::Staging(format!("invalid object key '{key}'")));
    }
    Ok(())
}

/// In-memory staging backend for tests and single-process runs.
pub struct MemoryStagingClient {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    signer: HandleSigner,
}

impl MemoryStagingClient {
    /// Create an empty in-memory staging area.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            signer: HandleSigner::new("memory-staging"),
        }
    }
}

impl Default for MemoryStagingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StagingClient for MemoryStagingClient {
    async fn issue_upload_handle(&self, key: &str, ttl: Duration) -> ConveyorResult<StagingHandle> {
        validate_key(key)?;
        let expires_at = Utc::now() + ttl;
        Ok(StagingHandle {
            key: key.to_string(),
            token: self.signer.sign("upload", key, expires_at),
            expires_at,
        })
    }

    async fn issue_download_handle(
        &self,
        key: &str,
        ttl: Duration,
    ) -> ConveyorResult<StagingHandle> {
        validate_key(key)?;
        let expires_at = Utc::now() + ttl;
        Ok(StagingHandle {
            key: key.to_string(),
            token: self.signer.sign("download", key, expires_at),
            expires_at,
        })
    }

    async fn exists(&self, key: &str) -> ConveyorResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn read(&self, key: &str) -> ConveyorResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ConveyorError::NotFound(format!("object '{key}'")))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> ConveyorResult<u64> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(bytes.len() as u64)
    }

    async fn size(&self, key: &str) -> ConveyorResult<u64> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| ConveyorError::NotFound(format!("object '{key}'")))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> ConveyorResult<u64> {
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok((before - objects.len()) as u64)
    }
}

/// Staging backend rooted at a local directory.
///
/// Object keys map one-to-one onto relative file paths under the root;
/// prefixes map onto directories.
pub struct LocalStagingClient {
    root: PathBuf,
    signer: HandleSigner,
}

impl LocalStagingClient {
    /// Open (creating if needed) a staging area rooted at `root`,
    /// signing handles with `secret`.
    pub async fn new(root: PathBuf, secret: impl Into<Vec<u8>>) -> ConveyorResult<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            signer: HandleSigner::new(secret),
        })
    }

    fn object_path(&self, key: &str) -> ConveyorResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn count_files(path: &Path) -> ConveyorResult<u64> {
        let mut count = 0;
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let ty = entry.file_type().await?;
                if ty.is_dir() {
                    stack.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl StagingClient for LocalStagingClient {
    async fn issue_upload_handle(&self, key: &str, ttl: Duration) -> ConveyorResult<StagingHandle> {
        validate_key(key)?;
        let expires_at = Utc::now() + ttl;
        Ok(StagingHandle {
            key: key.to_string(),
            token: self.signer.sign("upload", key, expires_at),
            expires_at,
        })
    }

    async fn issue_download_handle(
        &self,
        key: &str,
        ttl: Duration,
    ) -> ConveyorResult<StagingHandle> {
        validate_key(key)?;
        let expires_at = Utc::now() + ttl;
        Ok(StagingHandle {
            key: key.to_string(),
            token: self.signer.sign("download", key, expires_at),
            expires_at,
        })
    }

    async fn exists(&self, key: &str) -> ConveyorResult<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    async fn read(&self, key: &str) -> ConveyorResult<Vec<u8>> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(ConveyorError::NotFound(format!("object '{key}'")));
        }
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> ConveyorResult<u64> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn size(&self, key: &str) -> ConveyorResult<u64> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(ConveyorError::NotFound(format!("object '{key}'")));
        }
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> ConveyorResult<u64> {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ConveyorError::Staging("refusing to purge the root".into()));
        }
        validate_key(trimmed)?;
        let dir = self.root.join(trimmed);
        if !dir.is_dir() {
            return Ok(0);
        }
        let count = Self::count_files(&dir).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_write_read_exists() {
        let staging = MemoryStagingClient::new();
        assert!(!staging.exists("tasks/a/input/x.csv").await.unwrap());

        let n = staging.write("tasks/a/input/x.csv", b"a,b,c").await.unwrap();
        assert_eq!(n, 5);
        assert!(staging.exists("tasks/a/input/x.csv").await.unwrap());
        assert_eq!(staging.read("tasks/a/input/x.csv").await.unwrap(), b"a,b,c");
        assert_eq!(staging.size("tasks/a/input/x.csv").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn memory_delete_by_prefix_counts() {
        let staging = MemoryStagingClient::new();
        staging.write("tasks/a/input/x.csv", b"1").await.unwrap();
        staging.write("tasks/a/output/y.csv", b"2").await.unwrap();
        staging.write("tasks/b/input/z.csv", b"3").await.unwrap();

        let deleted = staging.delete_by_prefix("tasks/a/").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!staging.exists("tasks/a/input/x.csv").await.unwrap());
        assert!(staging.exists("tasks/b/input/z.csv").await.unwrap());
    }

    #[tokio::test]
    async fn handles_expire_per_ttl() {
        let staging = MemoryStagingClient::new();
        let handle = staging
            .issue_upload_handle("tasks/a/input/x.csv", Duration::minutes(5))
            .await
            .unwrap();
        assert!(handle.expires_at > Utc::now());
        assert_eq!(handle.key, "tasks/a/input/x.csv");
        assert!(!handle.token.is_empty());
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let staging = MemoryStagingClient::new();
        for key in ["../etc/passwd", "/abs", "a//b", "a/./b", ""] {
            assert!(staging.write(key, b"x").await.is_err(), "key: {key}");
        }
    }

    #[tokio::test]
    async fn local_roundtrip_and_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = LocalStagingClient::new(tmp.path().join("staging"), "secret")
            .await
            .unwrap();

        staging.write("tasks/a/input/x.csv", b"a,b").await.unwrap();
        staging.write("tasks/a/output/r.json", b"{}").await.unwrap();
        assert!(staging.exists("tasks/a/input/x.csv").await.unwrap());
        assert_eq!(staging.read("tasks/a/output/r.json").await.unwrap(), b"{}");
        assert_eq!(staging.size("tasks/a/input/x.csv").await.unwrap(), 3);

        let deleted = staging.delete_by_prefix("tasks/a/").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!staging.exists("tasks/a/input/x.csv").await.unwrap());

        // A second purge finds nothing.
        assert_eq!(staging.delete_by_prefix("tasks/a/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_refuses_root_purge() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = LocalStagingClient::new(tmp.path().join("staging"), "secret")
            .await
            .unwrap();
        assert!(staging.delete_by_prefix("/").await.is_err());
        assert!(staging.delete_by_prefix("").await.is_err());
    }
}
