//! Cached build artifacts
//!
//! A [`Diff`] is one piece of build output, either pulled lazily from object
//! storage or produced by a local build. Diffs live under the cache directory
//! and are released with [`Diff::close`].

pub mod cache;

pub use cache::{CacheStats, DiffCache};

use crate::error::{RootsmithError, RootsmithResult};
use crate::storage::ObjectStore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use uuid::Uuid;

/// Kind of build artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// Block-level memory diff
    Memfile,
    /// Root filesystem snapshot
    Snapshot,
}

impl DiffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memfile => "memfile",
            Self::Snapshot => "snapshot",
        }
    }

    /// Object name of this kind within a build
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Memfile => "memfile",
            Self::Snapshot => "rootfs.ext4",
        }
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one key derivation shared by every cache path
pub fn cache_key(build_id: &str, kind: DiffKind, block_size: u64) -> String {
    format!("{}/{}/{}", build_id, kind, block_size)
}

/// Object store key of a build artifact
pub fn storage_key(build_id: &str, kind: DiffKind) -> String {
    format!("{}/{}", build_id, kind.file_name())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffState {
    Uninitialized,
    Initialized { size: u64 },
    Closed,
}

/// State shared by every diff variant
#[derive(Debug)]
pub struct DiffFile {
    build_id: String,
    kind: DiffKind,
    block_size: u64,
    path: PathBuf,
    state: Mutex<DiffState>,
}

impl DiffFile {
    fn new(build_id: &str, kind: DiffKind, block_size: u64, path: PathBuf, state: DiffState) -> Self {
        Self {
            build_id: build_id.to_string(),
            kind,
            block_size,
            path,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> DiffState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DiffState) -> DiffState {
        std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            state,
        )
    }
}

/// Diff downloaded from object storage on first use
#[derive(Debug)]
pub struct StorageDiff {
    file: DiffFile,
}

/// Diff backed by a file a local build produced
#[derive(Debug)]
pub struct LocalDiff {
    file: DiffFile,
}

/// One cached build artifact
#[derive(Debug)]
pub enum Diff {
    Storage(StorageDiff),
    Local(LocalDiff),
}

impl Diff {
    /// Uninitialized diff whose content will be fetched into `dir`
    pub fn storage(
        build_id: &str,
        kind: DiffKind,
        block_size: u64,
        dir: &Path,
    ) -> RootsmithResult<Self> {
        check_block_size(build_id, kind, block_size)?;
        let path = dir.join(local_file_name(build_id, kind, block_size));
        Ok(Self::Storage(StorageDiff {
            file: DiffFile::new(build_id, kind, block_size, path, DiffState::Uninitialized),
        }))
    }

    /// Initialized diff over an existing local file
    pub async fn local(
        build_id: &str,
        kind: DiffKind,
        block_size: u64,
        path: impl Into<PathBuf>,
    ) -> RootsmithResult<Self> {
        check_block_size(build_id, kind, block_size)?;
        let path = path.into();
        let size = fs::metadata(&path)
            .await
            .map_err(|e| RootsmithError::io(format!("reading {}", path.display()), e))?
            .len();
        Ok(Self::Local(LocalDiff {
            file: DiffFile::new(
                build_id,
                kind,
                block_size,
                path,
                DiffState::Initialized { size },
            ),
        }))
    }

    fn file(&self) -> &DiffFile {
        match self {
            Self::Storage(d) => &d.file,
            Self::Local(d) => &d.file,
        }
    }

    pub fn build_id(&self) -> &str {
        &self.file().build_id
    }

    pub fn kind(&self) -> DiffKind {
        self.file().kind
    }

    pub fn block_size(&self) -> u64 {
        self.file().block_size
    }

    pub fn path(&self) -> &Path {
        &self.file().path
    }

    pub fn cache_key(&self) -> String {
        cache_key(self.build_id(), self.kind(), self.block_size())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.file().state(), DiffState::Initialized { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.file().state() == DiffState::Closed
    }

    /// Load the content. A no-op once initialized.
    pub async fn init(&self, store: &dyn ObjectStore) -> RootsmithResult<()> {
        let file = self.file();
        match file.state() {
            DiffState::Initialized { .. } => return Ok(()),
            DiffState::Closed => return Err(RootsmithError::DiffClosed(self.cache_key())),
            DiffState::Uninitialized => {}
        }

        let Self::Storage(_) = self else {
            return Err(RootsmithError::Internal(format!(
                "local diff {} has no content",
                self.cache_key()
            )));
        };

        let key = storage_key(&file.build_id, file.kind);
        let size = download(store, &key, &file.path).await.map_err(|e| {
            RootsmithError::DiffInit {
                key: self.cache_key(),
                reason: e.to_string(),
            }
        })?;

        // Closed while downloading: the file is ours to clean up
        let closed = {
            let mut state = file.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == DiffState::Closed {
                true
            } else {
                *state = DiffState::Initialized { size };
                false
            }
        };
        if closed {
            remove_local(&file.path).await;
            return Err(RootsmithError::DiffClosed(self.cache_key()));
        }

        debug!(key = %self.cache_key(), size, "Diff initialized from storage");
        Ok(())
    }

    /// Release the local file. Closing twice is a no-op.
    pub async fn close(&self) -> RootsmithResult<()> {
        let file = self.file();
        if file.set_state(DiffState::Closed) == DiffState::Closed {
            return Ok(());
        }

        match fs::remove_file(&file.path).await {
            Ok(()) => {
                debug!(key = %self.cache_key(), "Diff closed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RootsmithError::io(
                format!("removing {}", file.path.display()),
                e,
            )),
        }
    }

    pub fn size(&self) -> RootsmithResult<u64> {
        match self.file().state() {
            DiffState::Initialized { size } => Ok(size),
            DiffState::Closed => Err(RootsmithError::DiffClosed(self.cache_key())),
            DiffState::Uninitialized => Err(self.not_initialized()),
        }
    }

    /// Read up to `len` bytes at `offset`
    pub async fn read_at(&self, offset: u64, len: usize) -> RootsmithResult<Vec<u8>> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }

        let path = &self.file().path;
        let read_err = |e| RootsmithError::io(format!("reading {}", path.display()), e);

        let mut handle = fs::File::open(path).await.map_err(read_err)?;
        handle.seek(SeekFrom::Start(offset)).await.map_err(read_err)?;

        let len = len.min((size - offset) as usize);
        let mut buf = Vec::with_capacity(len);
        handle
            .take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(read_err)?;
        Ok(buf)
    }

    /// Read block `index`; the last block may be short, blocks past the end are empty
    pub async fn read_block(&self, index: u64) -> RootsmithResult<Vec<u8>> {
        let block_size = self.block_size();
        let Some(offset) = index.checked_mul(block_size) else {
            self.size()?;
            return Ok(Vec::new());
        };
        self.read_at(offset, block_size as usize).await
    }

    fn not_initialized(&self) -> RootsmithError {
        RootsmithError::DiffInit {
            key: self.cache_key(),
            reason: "diff is not initialized".to_string(),
        }
    }
}

fn check_block_size(build_id: &str, kind: DiffKind, block_size: u64) -> RootsmithResult<()> {
    if block_size == 0 {
        return Err(RootsmithError::Internal(format!(
            "diff {}/{} needs a positive block size",
            build_id, kind
        )));
    }
    Ok(())
}

/// Unique per instance, so a replaced diff never deletes its successor's file
fn local_file_name(build_id: &str, kind: DiffKind, block_size: u64) -> String {
    let digest = Sha256::digest(cache_key(build_id, kind, block_size).as_bytes());
    format!(
        "{}-{}.{}",
        &hex::encode(digest)[..16],
        Uuid::new_v4().simple(),
        kind
    )
}

async fn download(store: &dyn ObjectStore, key: &str, dest: &Path) -> RootsmithResult<u64> {
    let tmp = dest.with_extension("partial");
    let result = async {
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| RootsmithError::io(format!("creating {}", tmp.display()), e))?;
        let size = store.read_to(key, &mut file).await?;
        file.sync_all()
            .await
            .map_err(|e| RootsmithError::io(format!("syncing {}", tmp.display()), e))?;
        fs::rename(&tmp, dest)
            .await
            .map_err(|e| RootsmithError::io(format!("renaming {}", tmp.display()), e))?;
        Ok::<_, RootsmithError>(size)
    }
    .await;

    if result.is_err() {
        remove_local(&tmp).await;
    }
    result
}

async fn remove_local(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
