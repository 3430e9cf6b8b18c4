//! Rootsmith - VM root filesystem builder
//!
//! Pulls OCI images, flattens their layers into ext4 root filesystems
//! under a hard size limit, and caches build diffs with deferred cleanup.

pub mod audit;
pub mod build;
pub mod cli;
pub mod config;
pub mod diff;
pub mod error;
pub mod registry;
pub mod rootfs;
pub mod storage;
pub mod ui;

pub use error::{RootsmithError, RootsmithResult};
