//! Object storage
//!
//! Build artifacts are addressed by slash-separated keys such as
//! `{buildId}/rootfs.ext4`. The filesystem store maps keys below a root
//! directory and publishes writes atomically.

use crate::error::{RootsmithError, RootsmithResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Key/value blob storage for build artifacts
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream the object into `writer`, returning the bytes copied
    async fn read_to(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RootsmithResult<u64>;

    /// Read up to `len` bytes starting at `offset`
    async fn read_range(&self, key: &str, offset: u64, len: usize) -> RootsmithResult<Vec<u8>>;

    /// Store everything `reader` yields under `key`
    async fn write_from(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> RootsmithResult<u64>;

    /// Store the content of a local file under `key`
    async fn upload_file(&self, key: &str, path: &Path) -> RootsmithResult<u64> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| RootsmithError::io(format!("opening {}", path.display()), e))?;
        self.write_from(key, &mut file).await
    }

    async fn delete(&self, key: &str) -> RootsmithResult<()>;

    async fn size(&self, key: &str) -> RootsmithResult<u64>;

    /// Remove every object whose key starts with `prefix/`
    async fn remove_dir(&self, prefix: &str) -> RootsmithResult<()>;
}

/// Object store on the local filesystem
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> RootsmithResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(RootsmithError::storage(key, "invalid object key"));
        }
        Ok(self.root.join(relative))
    }

    async fn open(&self, key: &str) -> RootsmithResult<fs::File> {
        let path = self.resolve(key)?;
        fs::File::open(&path).await.map_err(|e| not_found_or(key, e))
    }
}

fn not_found_or(key: &str, e: std::io::Error) -> RootsmithError {
    if e.kind() == ErrorKind::NotFound {
        RootsmithError::ObjectNotFound(key.to_string())
    } else {
        RootsmithError::storage(key, e)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn read_to(
        &self,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> RootsmithResult<u64> {
        let mut file = self.open(key).await?;
        let copied = tokio::io::copy(&mut file, writer)
            .await
            .map_err(|e| RootsmithError::storage(key, e))?;
        writer
            .flush()
            .await
            .map_err(|e| RootsmithError::storage(key, e))?;
        Ok(copied)
    }

    async fn read_range(&self, key: &str, offset: u64, len: usize) -> RootsmithResult<Vec<u8>> {
        let mut file = self.open(key).await?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| RootsmithError::storage(key, e))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RootsmithError::storage(key, e))?;
        Ok(buf)
    }

    async fn write_from(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> RootsmithResult<u64> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| RootsmithError::storage(key, "object key has no parent"))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| RootsmithError::storage(key, e))?;

        let tmp = parent.join(format!(".{}.partial", uuid::Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            let written = tokio::io::copy(reader, &mut file).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;

        match written {
            Ok(written) => {
                debug!(key, bytes = written, "Stored object");
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(RootsmithError::storage(key, e))
            }
        }
    }

    async fn delete(&self, key: &str) -> RootsmithResult<()> {
        let path = self.resolve(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(key, e))
    }

    async fn size(&self, key: &str) -> RootsmithResult<u64> {
        let path = self.resolve(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| not_found_or(key, e))?;
        Ok(metadata.len())
    }

    async fn remove_dir(&self, prefix: &str) -> RootsmithResult<()> {
        let path = self.resolve(prefix.trim_end_matches('/'))?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RootsmithError::storage(prefix, e)),
        }
    }
}
