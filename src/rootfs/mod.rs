//! Rootfs materialization
//!
//! Flattens a fetched image and writes it as an ext4 image file, bounded
//! by a hard size limit.

pub mod budget;
pub mod ext4;
pub mod flatten;

pub use budget::SizeBudget;
pub use ext4::{Ext4Writer, FsImageWriter, ImageSeed};
pub use flatten::{EntryKind, FlatEntry, FlatTree};

use crate::error::{RootsmithError, RootsmithResult};
use crate::registry::OciImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Converts images into filesystem image files
#[derive(Clone)]
pub struct Materializer {
    writer: Arc<dyn FsImageWriter>,
}

impl Materializer {
    pub fn new(writer: Arc<dyn FsImageWriter>) -> Self {
        Self { writer }
    }

    pub fn ext4() -> Self {
        Self::new(Arc::new(Ext4Writer::new()))
    }

    /// Write `image` as a filesystem image at `dest`.
    ///
    /// Returns the image size. On any failure `dest` is removed, so a
    /// file at `dest` always means a complete image. Dropping the returned
    /// future cancels the conversion; the output is removed once the writer
    /// has stopped.
    #[instrument(skip(self, image, cancel), fields(image = %image.reference, dest = %dest.display()))]
    pub async fn materialize(
        &self,
        image: Arc<OciImage>,
        dest: &Path,
        max_bytes: u64,
        cancel: &CancellationToken,
    ) -> RootsmithResult<u64> {
        let writer = Arc::clone(&self.writer);
        let dest_owned = dest.to_path_buf();

        let conversion = cancel.child_token();
        let _abandon = conversion.clone().drop_guard();

        let task = tokio::task::spawn_blocking(move || {
            let guard = PartialOutput::new(&dest_owned);

            let tree = FlatTree::from_layers(&image.layers, max_bytes)?;
            info!(
                entries = tree.len(),
                content_bytes = tree.content_bytes(),
                "Flattened image layers"
            );

            if conversion.is_cancelled() {
                return Err(RootsmithError::Canceled(
                    "rootfs conversion canceled".to_string(),
                ));
            }

            let seed = ImageSeed::from_digest(&image.content_digest());
            let size = writer.write_image(&tree, &dest_owned, max_bytes, &seed, &conversion)?;

            // The caller may have gone away while the writer finished
            if conversion.is_cancelled() {
                return Err(RootsmithError::Canceled(
                    "rootfs conversion abandoned".to_string(),
                ));
            }

            guard.commit();
            Ok(size)
        });

        task.await
            .map_err(|e| RootsmithError::Internal(format!("conversion task failed: {}", e)))?
    }
}

/// Removes a half-written output unless committed
struct PartialOutput {
    path: PathBuf,
    committed: bool,
}

impl PartialOutput {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => warn!("Removed incomplete output {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove incomplete output {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{FlatTree, FsImageWriter, ImageSeed, SizeBudget};
    use crate::error::{RootsmithError, RootsmithResult};
    use crate::registry::{Layer, LayerDescriptor, OciImage};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::Path;
    use tar::{Builder, EntryType, Header};
    use tokio_util::sync::CancellationToken;

    /// Writes a listing of the tree, charging the budget entry by entry
    pub struct ListingWriter;

    impl FsImageWriter for ListingWriter {
        fn write_image(
            &self,
            tree: &FlatTree,
            dest: &Path,
            max_bytes: u64,
            seed: &ImageSeed,
            cancel: &CancellationToken,
        ) -> RootsmithResult<u64> {
            let mut out = std::fs::File::create(dest).unwrap();
            writeln!(out, "uuid {}", seed.uuid()).unwrap();

            let mut budget = SizeBudget::new(max_bytes)?;
            for (path, entry) in tree.iter() {
                if cancel.is_cancelled() {
                    return Err(RootsmithError::Canceled("listing".to_string()));
                }
                budget.charge(path, entry)?;
                writeln!(out, "{} {:o} {:?}", path.display(), entry.mode, entry.kind).unwrap();
            }
            Ok(std::fs::metadata(dest).unwrap().len())
        }
    }

    /// Builds layer tarballs for tests
    pub struct LayerBuilder {
        builder: Builder<Vec<u8>>,
    }

    impl LayerBuilder {
        pub fn new() -> Self {
            Self {
                builder: Builder::new(Vec::new()),
            }
        }

        fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
            let mut header = Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_mode(mode);
            header.set_size(size);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            header
        }

        pub fn file(mut self, path: &str, content: &[u8]) -> Self {
            let mut header = Self::header(EntryType::Regular, 0o644, content.len() as u64);
            self.builder.append_data(&mut header, path, content).unwrap();
            self
        }

        pub fn dir(mut self, path: &str) -> Self {
            let mut header = Self::header(EntryType::Directory, 0o755, 0);
            self.builder
                .append_data(&mut header, path, std::io::empty())
                .unwrap();
            self
        }

        pub fn symlink(mut self, path: &str, target: &str) -> Self {
            let mut header = Self::header(EntryType::Symlink, 0o777, 0);
            header.set_link_name(target).unwrap();
            self.builder
                .append_data(&mut header, path, std::io::empty())
                .unwrap();
            self
        }

        pub fn whiteout(self, path: &str) -> Self {
            let (dir, name) = match path.rsplit_once('/') {
                Some((dir, name)) => (format!("{}/", dir), name),
                None => (String::new(), path),
            };
            self.file(&format!("{}.wh.{}", dir, name), b"")
        }

        pub fn opaque(self, dir: &str) -> Self {
            self.file(&format!("{}/.wh..wh..opq", dir), b"")
        }

        /// Entry whose name bypasses path validation
        pub fn raw_path(mut self, path: &str, content: &[u8]) -> Self {
            let mut header = Self::header(EntryType::Regular, 0o644, content.len() as u64);
            let name = &mut header.as_old_mut().name;
            name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            self.builder.append(&header, content).unwrap();
            self
        }

        pub fn build(self) -> Vec<u8> {
            self.builder.into_inner().unwrap()
        }

        pub fn gzip(self) -> Vec<u8> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.build()).unwrap();
            encoder.finish().unwrap()
        }
    }

    pub fn layer(data: Vec<u8>) -> Layer {
        Layer {
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            data,
        }
    }

    pub fn image(reference: &str, blobs: Vec<Vec<u8>>) -> OciImage {
        let descriptors = blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| LayerDescriptor {
                digest: format!("sha256:{:064x}", i),
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                size: blob.len() as i64,
            })
            .collect();

        OciImage {
            reference: reference.to_string(),
            digest: None,
            descriptors: Some(descriptors),
            layers: blobs.into_iter().map(layer).collect(),
        }
    }
}
