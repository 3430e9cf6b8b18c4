//! Size accounting for the ext4 image
//!
//! Every entry is charged as it is staged so an oversized image fails
//! before the filesystem is ever created.

use crate::error::{RootsmithError, RootsmithResult};
use crate::rootfs::flatten::{EntryKind, FlatEntry};
use std::path::Path;

pub const FS_BLOCK_SIZE: u64 = 4096;
pub const INODE_SIZE: u64 = 256;

/// Superblock, group descriptors, bitmaps and reserved GDT blocks
const BASE_OVERHEAD: u64 = 2 << 20;
/// Inodes reserved by ext4 before the first user inode
const RESERVED_INODES: u64 = 11;
/// Symlink targets shorter than this live inside the inode
const FAST_SYMLINK_MAX: usize = 60;
/// Data blocks covered by the four extents stored in the inode
const INLINE_EXTENT_BLOCKS: u64 = 4 * 32_768;

/// Running estimate of the bytes an image will occupy
#[derive(Debug, Clone)]
pub struct SizeBudget {
    limit: u64,
    used: u64,
    inodes: u64,
}

impl SizeBudget {
    /// Fails when even an empty filesystem would exceed `limit`
    pub fn new(limit: u64) -> RootsmithResult<Self> {
        let budget = Self {
            limit,
            used: BASE_OVERHEAD + RESERVED_INODES * INODE_SIZE,
            inodes: RESERVED_INODES,
        };
        if budget.used > limit {
            return Err(RootsmithError::size_exceeded(limit));
        }
        Ok(budget)
    }

    /// Charge one tree entry
    pub fn charge(&mut self, path: &Path, entry: &FlatEntry) -> RootsmithResult<()> {
        let name_len = path.file_name().map(|n| n.len()).unwrap_or(0) as u64;
        let dirent = round_up(8 + name_len, 4);

        let (data, inode) = match &entry.kind {
            EntryKind::File(content) => {
                let blocks = round_up(content.len() as u64, FS_BLOCK_SIZE) / FS_BLOCK_SIZE;
                let index_blocks = blocks.saturating_sub(1) / INLINE_EXTENT_BLOCKS;
                ((blocks + index_blocks) * FS_BLOCK_SIZE, INODE_SIZE)
            }
            EntryKind::Directory => (FS_BLOCK_SIZE, INODE_SIZE),
            EntryKind::Symlink(target) if target.as_os_str().len() < FAST_SYMLINK_MAX => {
                (0, INODE_SIZE)
            }
            EntryKind::Symlink(_) => (FS_BLOCK_SIZE, INODE_SIZE),
            EntryKind::Hardlink(_) => (0, 0),
        };

        if inode > 0 {
            self.inodes += 1;
        }
        self.add(dirent + data + inode)
    }

    fn add(&mut self, bytes: u64) -> RootsmithResult<()> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(RootsmithError::size_exceeded(self.limit));
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Inodes to provision, with slack for lost+found and allocator rounding
    pub fn inodes(&self) -> u64 {
        self.inodes + 64 + self.inodes / 10
    }

    /// Device size to allocate: usage plus allocator headroom, never above the limit
    pub fn image_size(&self) -> u64 {
        let wanted = round_up(self.used + self.used / 5 + (4 << 20), FS_BLOCK_SIZE);
        wanted.min(self.max_image_size())
    }

    /// Largest block-aligned size within the limit
    pub fn max_image_size(&self) -> u64 {
        self.limit / FS_BLOCK_SIZE * FS_BLOCK_SIZE
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
