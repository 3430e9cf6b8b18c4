//! Layer flattening
//!
//! Applies image layers in order into a single tree: later layers win,
//! `.wh.<name>` entries delete lower paths and `.wh..wh..opq` hides
//! everything lower layers put into a directory.
//!
//! File content is held in memory, so the size ceiling is enforced on the
//! live content as each entry is read.

use crate::error::{RootsmithError, RootsmithResult};
use crate::registry::Layer;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::ops::Bound;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Content of a flattened entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File(Vec<u8>),
    Directory,
    Symlink(PathBuf),
    /// Hard link to another path of the tree
    Hardlink(PathBuf),
}

/// A path of the final filesystem with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl FlatEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Bytes of regular file content
    pub fn content_len(&self) -> u64 {
        match &self.kind {
            EntryKind::File(data) => data.len() as u64,
            _ => 0,
        }
    }
}

/// The union of all layers, keyed by root-relative path.
///
/// Iteration is in path order, parents before children.
#[derive(Debug, Clone, Default)]
pub struct FlatTree {
    entries: BTreeMap<PathBuf, FlatEntry>,
    /// Regular file content currently in the tree
    content: u64,
}

impl FlatTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten layers in application order.
    ///
    /// Fails with `SizeExceeded` as soon as the file content would pass
    /// `max_bytes`, before later layers are read.
    pub fn from_layers(layers: &[Layer], max_bytes: u64) -> RootsmithResult<Self> {
        let mut tree = Self::new();
        for (index, layer) in layers.iter().enumerate() {
            debug!(
                layer = index + 1,
                total = layers.len(),
                size = layer.data.len(),
                "Applying layer"
            );
            tree.apply_layer(&layer.data, max_bytes)
                .map_err(|e| match e {
                    RootsmithError::LayerExtraction { reason } => {
                        RootsmithError::LayerExtraction {
                            reason: format!("layer {}: {}", index, reason),
                        }
                    }
                    other => other,
                })?;
        }
        Ok(tree)
    }

    /// Apply one layer blob (plain or gzip-compressed tar) on top of the tree
    pub fn apply_layer(&mut self, blob: &[u8], max_bytes: u64) -> RootsmithResult<()> {
        let reader: Box<dyn Read + '_> = if blob.starts_with(&GZIP_MAGIC) {
            Box::new(GzDecoder::new(blob))
        } else {
            Box::new(blob)
        };

        let mut archive = Archive::new(reader);
        let entries = archive.entries().map_err(extraction_error)?;

        // Paths written by this layer survive its own opaque markers
        let mut added: HashSet<PathBuf> = HashSet::new();

        for entry in entries {
            let mut entry = entry.map_err(extraction_error)?;
            let raw = entry.path().map_err(extraction_error)?.into_owned();

            let Some(path) = normalize(&raw) else {
                debug!("Skipping entry outside the root: {}", raw.display());
                continue;
            };

            let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if name == OPAQUE_WHITEOUT {
                self.clear_lower(&parent, &added);
                continue;
            }

            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                self.remove_subtree(&parent.join(hidden));
                continue;
            }

            let header = entry.header();
            let mode = header.mode().map_err(extraction_error)?;
            let uid = header.uid().map_err(extraction_error)?;
            let gid = header.gid().map_err(extraction_error)?;
            let mtime = header.mtime().map_err(extraction_error)?;
            let entry_type = header.entry_type();

            let kind = match entry_type {
                EntryType::Regular | EntryType::Continuous => {
                    let size = entry.size();
                    let replaced = self.entries.get(&path).map_or(0, FlatEntry::content_len);
                    if self.content.saturating_sub(replaced).saturating_add(size) > max_bytes {
                        debug!(path = %path.display(), size, "Layer content over the limit");
                        return Err(RootsmithError::size_exceeded(max_bytes));
                    }
                    let mut data = Vec::with_capacity(size as usize);
                    entry.read_to_end(&mut data).map_err(extraction_error)?;
                    EntryKind::File(data)
                }
                EntryType::Directory => EntryKind::Directory,
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(extraction_error)?
                        .ok_or_else(|| missing_link(&path))?;
                    EntryKind::Symlink(target.into_owned())
                }
                EntryType::Link => {
                    let target = entry
                        .link_name()
                        .map_err(extraction_error)?
                        .ok_or_else(|| missing_link(&path))?;
                    match normalize(&target) {
                        Some(target) => EntryKind::Hardlink(target),
                        None => {
                            debug!("Skipping hard link leaving the root: {}", path.display());
                            continue;
                        }
                    }
                }
                other => {
                    debug!("Skipping unsupported entry {:?} at {}", other, path.display());
                    continue;
                }
            };

            self.insert(
                path.clone(),
                FlatEntry {
                    kind,
                    mode,
                    uid,
                    gid,
                    mtime,
                },
            );
            added.insert(path);
        }

        Ok(())
    }

    fn insert(&mut self, path: PathBuf, entry: FlatEntry) {
        // A directory over a directory keeps its children; anything else replaces them
        let keeps_children =
            entry.is_dir() && self.entries.get(&path).is_some_and(FlatEntry::is_dir);
        if !keeps_children {
            for child in self.descendants(&path) {
                self.remove_entry(&child);
            }
        }
        self.content += entry.content_len();
        if let Some(old) = self.entries.insert(path, entry) {
            self.content -= old.content_len();
        }
    }

    fn remove_entry(&mut self, path: &Path) {
        if let Some(old) = self.entries.remove(path) {
            self.content -= old.content_len();
        }
    }

    fn remove_subtree(&mut self, path: &Path) {
        for child in self.descendants(path) {
            self.remove_entry(&child);
        }
        self.remove_entry(path);
    }

    fn clear_lower(&mut self, dir: &Path, keep: &HashSet<PathBuf>) {
        for child in self.descendants(dir) {
            if !keep.contains(&child) {
                self.remove_entry(&child);
            }
        }
    }

    fn descendants(&self, dir: &Path) -> Vec<PathBuf> {
        self.entries
            .range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(dir))
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&FlatEntry> {
        self.entries.get(path.as_ref())
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&Path, &FlatEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_path(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of regular file content
    pub fn content_bytes(&self) -> u64 {
        self.content
    }
}

/// Root-relative form of a tar path; `None` for the root itself or paths escaping it
fn normalize(raw: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn extraction_error(e: std::io::Error) -> RootsmithError {
    RootsmithError::LayerExtraction {
        reason: e.to_string(),
    }
}

fn missing_link(path: &Path) -> RootsmithError {
    RootsmithError::LayerExtraction {
        reason: format!("link without target at {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::testutil::{layer, LayerBuilder};

    fn flatten(layers: &[Layer]) -> RootsmithResult<FlatTree> {
        FlatTree::from_layers(layers, u64::MAX)
    }

    fn paths(tree: &FlatTree) -> Vec<String> {
        tree.iter()
            .map(|(p, _)| p.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn later_layer_wins() {
        let tree = flatten(&[
            layer(LayerBuilder::new().dir("etc").file("etc/hostname", b"base").build()),
            layer(LayerBuilder::new().file("etc/hostname", b"override").build()),
        ])
        .unwrap();

        assert_eq!(
            tree.get("etc/hostname").unwrap().kind,
            EntryKind::File(b"override".to_vec())
        );
    }

    #[test]
    fn whiteout_removes_path_and_children() {
        let tree = flatten(&[
            layer(
                LayerBuilder::new()
                    .dir("opt")
                    .dir("opt/app")
                    .file("opt/app/bin", b"x")
                    .file("opt/keep", b"y")
                    .build(),
            ),
            layer(LayerBuilder::new().whiteout("opt/app").build()),
        ])
        .unwrap();

        assert_eq!(paths(&tree), vec!["opt", "opt/keep"]);
    }

    #[test]
    fn opaque_whiteout_hides_lower_content_only() {
        let tree = flatten(&[
            layer(
                LayerBuilder::new()
                    .dir("var")
                    .file("var/old", b"1")
                    .file("var-sibling", b"2")
                    .build(),
            ),
            layer(
                LayerBuilder::new()
                    .dir("var")
                    .file("var/new", b"3")
                    .opaque("var")
                    .build(),
            ),
        ])
        .unwrap();

        assert_eq!(paths(&tree), vec!["var", "var/new", "var-sibling"]);
    }

    #[test]
    fn file_replacing_directory_drops_children() {
        let tree = flatten(&[
            layer(LayerBuilder::new().dir("srv").file("srv/a", b"a").build()),
            layer(LayerBuilder::new().file("srv", b"now a file").build()),
        ])
        .unwrap();

        assert_eq!(paths(&tree), vec!["srv"]);
    }

    #[test]
    fn directory_over_directory_keeps_children() {
        let tree = flatten(&[
            layer(LayerBuilder::new().dir("usr").file("usr/a", b"a").build()),
            layer(LayerBuilder::new().dir("usr").build()),
        ])
        .unwrap();

        assert_eq!(paths(&tree), vec!["usr", "usr/a"]);
    }

    #[test]
    fn gzip_layers_and_links() {
        let tree = flatten(&[layer(
            LayerBuilder::new()
                .file("bin/busybox", b"elf")
                .symlink("bin/sh", "busybox")
                .gzip(),
        )])
        .unwrap();

        assert_eq!(
            tree.get("bin/sh").unwrap().kind,
            EntryKind::Symlink(PathBuf::from("busybox"))
        );
        assert_eq!(tree.content_bytes(), 3);
    }

    #[test]
    fn entries_escaping_root_are_skipped() {
        let blob = LayerBuilder::new()
            .file("ok", b"1")
            .raw_path("../evil", b"2")
            .build();
        let tree = flatten(&[layer(blob)]).unwrap();
        assert_eq!(paths(&tree), vec!["ok"]);
    }

    #[test]
    fn corrupt_layer_is_an_extraction_error() {
        let mut blob = GZIP_MAGIC.to_vec();
        blob.extend_from_slice(b"definitely not deflate");

        let err = flatten(&[layer(blob)]).unwrap_err();
        assert!(matches!(err, RootsmithError::LayerExtraction { .. }));
    }

    #[test]
    fn corrupt_layer_names_the_layer_once() {
        let err = flatten(&[
            layer(LayerBuilder::new().file("ok", b"1").build()),
            layer(vec![0x1f, 0x8b, 0, 1, 2, 3]),
        ])
        .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("Failed to extract layer: layer 1: "), "{}", message);
        assert_eq!(message.matches("Failed to extract layer").count(), 1);
    }

    #[test]
    fn oversized_layer_fails_before_later_layers_are_read() {
        let err = FlatTree::from_layers(
            &[
                layer(LayerBuilder::new().file("blob", &vec![0u8; 8 << 20]).gzip()),
                layer(vec![0x1f, 0x8b, 0, 1, 2, 3]),
            ],
            5 << 20,
        )
        .unwrap_err();

        assert!(matches!(err, RootsmithError::SizeExceeded { limit_mb: 5 }));
    }

    #[test]
    fn ceiling_counts_live_content_only() {
        let tree = FlatTree::from_layers(
            &[
                layer(LayerBuilder::new().file("a", &vec![0u8; 3 << 20]).build()),
                layer(LayerBuilder::new().whiteout("a").build()),
                layer(LayerBuilder::new().file("b", &vec![0u8; 3 << 20]).build()),
                layer(LayerBuilder::new().file("b", &vec![0u8; 4 << 20]).build()),
            ],
            5 << 20,
        )
        .unwrap();

        assert_eq!(paths(&tree), vec!["b"]);
        assert_eq!(tree.content_bytes(), 4 << 20);
    }
}
