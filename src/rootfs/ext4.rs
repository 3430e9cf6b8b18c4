//! ext4 image writer
//!
//! Stages the flattened tree in a scratch directory and lets `mke2fs -d`
//! populate a fresh filesystem from it. Output is byte-for-byte
//! reproducible for the same tree and seed.

use crate::error::{RootsmithError, RootsmithResult};
use crate::rootfs::budget::{SizeBudget, FS_BLOCK_SIZE};
use crate::rootfs::flatten::{EntryKind, FlatEntry, FlatTree};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timestamp mke2fs stamps into superblock and inode times
const FIXED_EPOCH: &str = "1";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// mke2fs messages meaning the device was too small
const OUT_OF_SPACE: &[&str] = &[
    "Could not allocate block",
    "Could not allocate inode",
    "No space left on device",
];

/// Per-image seed for every value mke2fs would otherwise randomize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSeed([u8; 32]);

impl ImageSeed {
    pub fn from_digest(digest: &str) -> Self {
        Self(Sha256::digest(digest.as_bytes()).into())
    }

    /// Filesystem UUID
    pub fn uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.0[..16]);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Directory hash seed
    pub fn hash_seed(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.0[16..]);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Turns a flattened tree into a filesystem image file
pub trait FsImageWriter: Send + Sync {
    /// Write `tree` to `dest` and return the image size in bytes.
    ///
    /// Must fail with `SizeExceeded` instead of producing an image larger
    /// than `max_bytes`.
    fn write_image(
        &self,
        tree: &FlatTree,
        dest: &Path,
        max_bytes: u64,
        seed: &ImageSeed,
        cancel: &CancellationToken,
    ) -> RootsmithResult<u64>;
}

/// Writer backed by e2fsprogs
pub struct Ext4Writer {
    mkfs: PathBuf,
}

impl Ext4Writer {
    pub fn new() -> Self {
        Self::with_binary("mke2fs")
    }

    pub fn with_binary(mkfs: impl Into<PathBuf>) -> Self {
        Self { mkfs: mkfs.into() }
    }

    /// Whether the mke2fs binary can be executed
    pub fn is_available(&self) -> bool {
        Command::new(&self.mkfs)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn mkfs(
        &self,
        staging: &Path,
        dest: &Path,
        size: u64,
        inodes: u64,
        seed: &ImageSeed,
        cancel: &CancellationToken,
    ) -> RootsmithResult<(ExitStatus, String)> {
        let file = fs::File::create(dest)
            .map_err(|e| RootsmithError::io(format!("creating {}", dest.display()), e))?;
        file.set_len(size)
            .map_err(|e| RootsmithError::io(format!("sizing {}", dest.display()), e))?;
        drop(file);

        let mut cmd = Command::new(&self.mkfs);
        cmd.args(["-q", "-F", "-t", "ext4"])
            .args(["-b", &FS_BLOCK_SIZE.to_string()])
            .args(["-I", "256", "-m", "0", "-O", "^has_journal"])
            .args(["-N", &inodes.to_string()])
            .args(["-U", &seed.uuid().to_string()])
            .arg("-E")
            .arg(format!("root_owner=0:0,hash_seed={}", seed.hash_seed()))
            .arg("-d")
            .arg(staging)
            .arg(dest)
            .arg(format!("{}k", size / 1024))
            .env("E2FSPROGS_FAKE_TIME", FIXED_EPOCH)
            .env("SOURCE_DATE_EPOCH", FIXED_EPOCH)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("Running: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| RootsmithError::command_failed("mke2fs", e))?;

        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| RootsmithError::command_failed("mke2fs", e))?
            {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RootsmithError::Canceled(
                    "filesystem creation canceled".to_string(),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok((status, stderr))
    }
}

impl Default for Ext4Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl FsImageWriter for Ext4Writer {
    fn write_image(
        &self,
        tree: &FlatTree,
        dest: &Path,
        max_bytes: u64,
        seed: &ImageSeed,
        cancel: &CancellationToken,
    ) -> RootsmithResult<u64> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".rootfs-staging-")
            .tempdir_in(parent)
            .map_err(|e| RootsmithError::io("creating staging directory", e))?;

        let mut budget = SizeBudget::new(max_bytes)?;
        for (path, entry) in tree.iter() {
            if cancel.is_cancelled() {
                return Err(RootsmithError::Canceled("rootfs staging canceled".to_string()));
            }
            budget.charge(path, entry)?;
            stage_entry(staging.path(), path, entry)?;
        }
        finalize_metadata(staging.path(), tree)?;

        debug!(
            entries = tree.len(),
            estimated = budget.used(),
            "Staged rootfs tree"
        );

        let mut size = budget.image_size();
        loop {
            let (status, stderr) =
                self.mkfs(staging.path(), dest, size, budget.inodes(), seed, cancel)?;
            if status.success() {
                break;
            }

            if OUT_OF_SPACE.iter().any(|m| stderr.contains(m)) {
                if size < budget.max_image_size() {
                    warn!(size, "Estimated image size too small, retrying at the limit");
                    size = budget.max_image_size();
                    continue;
                }
                return Err(RootsmithError::size_exceeded(max_bytes));
            }

            return Err(RootsmithError::Conversion(format!(
                "mke2fs failed ({}): {}",
                status,
                stderr.trim()
            )));
        }

        info!(size, "Created ext4 image");
        Ok(size)
    }
}

fn stage_entry(root: &Path, path: &Path, entry: &FlatEntry) -> RootsmithResult<()> {
    let target = root.join(path);
    let staging_err = |e| RootsmithError::io(format!("staging {}", path.display()), e);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(staging_err)?;
    }

    match &entry.kind {
        EntryKind::File(data) => {
            fs::write(&target, data).map_err(staging_err)?;
            set_mode(&target, entry.mode).map_err(staging_err)?;
        }
        // Permissions are applied after children exist
        EntryKind::Directory => fs::create_dir_all(&target).map_err(staging_err)?,
        EntryKind::Symlink(link) => symlink(link, &target).map_err(staging_err)?,
        EntryKind::Hardlink(original) => {
            let source = root.join(original);
            if source.symlink_metadata().is_ok() {
                fs::hard_link(&source, &target).map_err(staging_err)?;
            } else {
                debug!(
                    "Dropping hard link {} to missing {}",
                    path.display(),
                    original.display()
                );
                return Ok(());
            }
        }
    }

    set_owner(&target, entry.uid, entry.gid);
    Ok(())
}

/// Apply directory modes and mtimes, children before parents
fn finalize_metadata(root: &Path, tree: &FlatTree) -> RootsmithResult<()> {
    for (path, entry) in tree.iter().rev() {
        let target = root.join(path);
        match entry.kind {
            EntryKind::Directory => {
                set_mode(&target, entry.mode)
                    .map_err(|e| RootsmithError::io(format!("staging {}", path.display()), e))?;
                set_mtime(&target, entry.mtime);
            }
            EntryKind::File(_) => set_mtime(&target, entry.mtime),
            EntryKind::Symlink(_) | EntryKind::Hardlink(_) => {}
        }
    }
    Ok(())
}

fn set_mtime(target: &Path, mtime: u64) {
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime);
    if let Err(e) = fs::File::open(target).and_then(|f| f.set_modified(time)) {
        debug!("Could not set mtime of {}: {}", target.display(), e);
    }
}

#[cfg(unix)]
fn set_mode(target: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_target: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, _target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks require a unix host",
    ))
}

/// Ownership only sticks when running as root; mke2fs copies whatever it finds
#[cfg(unix)]
fn set_owner(target: &Path, uid: u64, gid: u64) {
    let (Ok(uid), Ok(gid)) = (u32::try_from(uid), u32::try_from(gid)) else {
        return;
    };
    if let Err(e) = std::os::unix::fs::lchown(target, Some(uid), Some(gid)) {
        debug!("Could not chown {}: {}", target.display(), e);
    }
}

#[cfg(not(unix))]
fn set_owner(_target: &Path, _uid: u64, _gid: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::testutil::{layer, LayerBuilder};
    use tempfile::TempDir;

    fn sample_tree() -> FlatTree {
        FlatTree::from_layers(
            &[layer(
                LayerBuilder::new()
                    .dir("etc")
                    .file("etc/hostname", b"sandbox\n")
                    .dir("bin")
                    .file("bin/busybox", &[0x7f; 9000])
                    .symlink("bin/sh", "busybox")
                    .build(),
            )],
            u64::MAX,
        )
        .unwrap()
    }

    #[test]
    fn seed_is_stable_per_digest() {
        let a = ImageSeed::from_digest("sha256:abc");
        let b = ImageSeed::from_digest("sha256:abc");
        let c = ImageSeed::from_digest("sha256:abd");
        assert_eq!(a.uuid(), b.uuid());
        assert_ne!(a.uuid(), a.hash_seed());
        assert_ne!(a.uuid(), c.uuid());
    }

    #[test]
    fn oversized_tree_fails_before_mkfs() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("rootfs.ext4");
        let tree = FlatTree::from_layers(
            &[layer(LayerBuilder::new().file("blob", &vec![1u8; 3 << 20]).build())],
            u64::MAX,
        )
        .unwrap();

        // A missing binary proves mke2fs is never reached
        let writer = Ext4Writer::with_binary("/nonexistent/mke2fs");
        let err = writer
            .write_image(
                &tree,
                &dest,
                4 << 20,
                &ImageSeed::from_digest("d"),
                &CancellationToken::new(),
            )
            .unwrap_err();

        assert!(err.is_size_limit(), "unexpected error: {}", err);
        assert!(!dest.exists());
    }

    #[test]
    fn canceled_before_staging() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Ext4Writer::with_binary("/nonexistent/mke2fs")
            .write_image(
                &sample_tree(),
                &temp.path().join("rootfs.ext4"),
                64 << 20,
                &ImageSeed::from_digest("d"),
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err, RootsmithError::Canceled(_)));
    }

    #[test]
    fn staging_directory_is_removed() {
        let temp = TempDir::new().unwrap();
        let _ = Ext4Writer::with_binary("/nonexistent/mke2fs").write_image(
            &sample_tree(),
            &temp.path().join("rootfs.ext4"),
            64 << 20,
            &ImageSeed::from_digest("d"),
            &CancellationToken::new(),
        );

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".rootfs-staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn writes_image_within_limit() {
        let writer = Ext4Writer::new();
        if !writer.is_available() {
            eprintln!("mke2fs not installed, skipping");
            return;
        }

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("rootfs.ext4");
        let size = writer
            .write_image(
                &sample_tree(),
                &dest,
                64 << 20,
                &ImageSeed::from_digest("sha256:sample"),
                &CancellationToken::new(),
            )
            .unwrap();

        assert!(size <= 64 << 20);
        assert_eq!(fs::metadata(&dest).unwrap().len(), size);
    }

    #[test]
    fn identical_input_gives_identical_bytes() {
        let writer = Ext4Writer::new();
        if !writer.is_available() {
            eprintln!("mke2fs not installed, skipping");
            return;
        }

        let temp = TempDir::new().unwrap();
        let seed = ImageSeed::from_digest("sha256:sample");
        let cancel = CancellationToken::new();

        let first = temp.path().join("a.ext4");
        let second = temp.path().join("b.ext4");
        writer
            .write_image(&sample_tree(), &first, 64 << 20, &seed, &cancel)
            .unwrap();
        writer
            .write_image(&sample_tree(), &second, 64 << 20, &seed, &cancel)
            .unwrap();

        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }
}
