//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Rootsmith - VM root filesystem builder
///
/// Converts OCI images into ext4 root filesystems for microVM templates
/// and caches the resulting build diffs.
#[derive(Parser, Debug)]
#[command(name = "rootsmith")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "ROOTSMITH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format (defaults to general.log_format)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a root filesystem image from a container image
    Build(BuildArgs),

    /// Print the compressed size of a container image
    Size(SizeArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Image reference (e.g. docker.io/library/alpine:3.19), or a bare tag of
    /// the configured ECR repository
    pub image: String,

    /// Build identity (generated if not provided)
    #[arg(long)]
    pub build_id: Option<String>,

    /// Output path of the ext4 image (defaults to ./<build-id>.ext4)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum rootfs size in MB (defaults to build.max_rootfs_mb)
    #[arg(long)]
    pub max_size_mb: Option<u64>,

    /// Cancel the build after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

/// Arguments for the size command
#[derive(Parser, Debug)]
pub struct SizeArgs {
    /// Image reference, or a bare tag of the configured ECR repository
    pub image: String,

    /// Print the size in bytes only
    #[arg(long)]
    pub bytes: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.retention_hours)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Resolve the format from the config value, defaulting to text
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}
