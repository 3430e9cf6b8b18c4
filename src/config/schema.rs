//! Configuration schema for rootsmith
//!
//! Configuration is stored at `~/.config/rootsmith/config.toml`. Registry
//! identity may also come from the environment, see [`Config::apply_env`].

use crate::error::{RootsmithError, RootsmithResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container registry settings
    pub registry: RegistryConfig,

    /// Diff cache settings
    pub cache: CacheConfig,

    /// Build limits
    pub build: BuildConfig,

    /// Shutdown drain settings
    pub drain: DrainConfig,

    /// Object storage settings
    pub storage: StorageConfig,
}

impl Config {
    /// Overlay environment variables on top of the file configuration.
    ///
    /// Called once at startup; the result is passed by reference afterwards.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

        if let Some(v) = non_empty("AWS_ACCOUNT_ID") {
            self.registry.account_id = Some(v);
        }
        if let Some(v) = non_empty("AWS_REGION") {
            self.registry.region = Some(v);
        }
        if let Some(v) = non_empty("AWS_ECR_REPOSITORY_NAME") {
            self.registry.repository = Some(v);
        }
        if let Some(v) = non_empty("ENVIRONMENT") {
            if let Ok(env) = v.parse() {
                self.general.environment = env;
            }
        }
    }

    /// Validate that everything ECR image resolution needs is present.
    ///
    /// All missing variables are reported in one error.
    pub fn check_required(&self) -> RootsmithResult<()> {
        if self.registry.auth != AuthMode::Ecr {
            return Ok(());
        }

        let mut missing = Vec::new();
        if self.registry.account_id.is_none() {
            missing.push("AWS_ACCOUNT_ID".to_string());
        }
        if self.registry.repository.is_none() {
            missing.push("AWS_ECR_REPOSITORY_NAME".to_string());
        }
        if self.registry.region.is_none() {
            missing.push("AWS_REGION".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RootsmithError::ConfigMissing(missing))
        }
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Prod,
}

impl Environment {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::str::FromStr for Environment {
    type Err = RootsmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => Err(RootsmithError::Internal(format!(
                "unknown environment: {}",
                other
            ))),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,

    /// Deployment environment; local skips drain delays
    pub environment: Environment,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
            environment: Environment::Local,
        }
    }
}

/// How registry credentials are obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Anonymous,
    Ecr,
}

/// Container registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Credential provider
    pub auth: AuthMode,

    /// AWS account owning the ECR registry
    pub account_id: Option<String>,

    /// AWS region
    pub region: Option<String>,

    /// ECR repository name
    pub repository: Option<String>,

    /// Explicit registry host, overrides the derived ECR host
    pub registry_host: Option<String>,

    /// AWS CLI profile used for ECR tokens
    pub profile: Option<String>,

    /// Target OS for multi-platform images
    pub platform_os: String,

    /// Target architecture for multi-platform images
    pub platform_arch: String,

    /// Timeout for a single image fetch
    pub fetch_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth: AuthMode::Anonymous,
            account_id: None,
            region: None,
            repository: None,
            registry_host: None,
            profile: None,
            platform_os: "linux".to_string(),
            platform_arch: "amd64".to_string(),
            fetch_timeout_secs: 300,
        }
    }
}

impl RegistryConfig {
    /// Registry host: the explicit override, else `{account}.dkr.ecr.{region}.amazonaws.com`
    pub fn registry_host(&self) -> Option<String> {
        if let Some(host) = &self.registry_host {
            return Some(host.clone());
        }
        let account = self.account_id.as_ref()?;
        let region = self.region.as_deref().unwrap_or("us-east-1");
        Some(format!("{}.dkr.ecr.{}.amazonaws.com", account, region))
    }

    /// Expand a bare template tag to `{registry_host}/{repository}:{tag}` under ECR auth.
    ///
    /// References with a repository path, tag or digest pass through unchanged.
    pub fn resolve_image(&self, image: &str) -> String {
        let bare_tag = !image.is_empty() && !image.contains(&['/', ':', '@'][..]);
        if self.auth != AuthMode::Ecr || !bare_tag {
            return image.to_string();
        }
        match (self.registry_host(), &self.repository) {
            (Some(host), Some(repository)) => format!("{}/{}:{}", host, repository, image),
            _ => image.to_string(),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Diff cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached diffs (defaults to the state dir)
    pub dir: Option<PathBuf>,

    /// How long an entry lives after its last insert or hit
    pub retention_hours: u64,

    /// Cadence of the background eviction sweep
    pub eviction_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_hours: 25,
            eviction_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

/// Build limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Hard ceiling for the produced rootfs, in MB
    pub max_rootfs_mb: u64,

    /// Block size used when reading diffs
    pub block_size: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_rootfs_mb: 15_000,
            block_size: 4096,
        }
    }
}

impl BuildConfig {
    pub fn max_rootfs_bytes(&self) -> u64 {
        self.max_rootfs_mb << 20
    }
}

/// Shutdown drain delays.
///
/// Stopgaps for out-of-process health check propagation, not a correctness
/// mechanism. Ignored in the local environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Wait after announcing Draining, before waiting for builds
    pub announce_delay_secs: u64,

    /// Wait after the last build finished, before exiting
    pub final_delay_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            announce_delay_secs: 5,
            final_delay_secs: 15,
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem object store (defaults to the state dir)
    pub root: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("retention_hours = 25"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [registry]
            auth = "ecr"
            region = "eu-west-1"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.registry.auth, AuthMode::Ecr);
        assert_eq!(config.registry.platform_arch, "amd64");
        assert_eq!(config.cache.retention(), Duration::from_secs(25 * 3600));
    }

    #[test]
    fn env_overlay_sets_registry_identity() {
        let mut config = Config::default();
        config.apply_vars(vars(&[
            ("AWS_ACCOUNT_ID", "123456789012"),
            ("AWS_REGION", "us-west-2"),
            ("AWS_ECR_REPOSITORY_NAME", "templates"),
            ("ENVIRONMENT", "prod"),
        ]));

        assert_eq!(config.general.environment, Environment::Prod);
        assert_eq!(
            config.registry.registry_host().as_deref(),
            Some("123456789012.dkr.ecr.us-west-2.amazonaws.com")
        );
    }

    #[test]
    fn bare_tags_resolve_against_the_ecr_repository() {
        let mut config = Config::default();
        config.apply_vars(vars(&[
            ("AWS_ACCOUNT_ID", "123456789012"),
            ("AWS_REGION", "us-west-2"),
            ("AWS_ECR_REPOSITORY_NAME", "templates"),
        ]));

        // Anonymous registries take references as given
        assert_eq!(config.registry.resolve_image("tmpl-1"), "tmpl-1");

        config.registry.auth = AuthMode::Ecr;
        assert_eq!(
            config.registry.resolve_image("tmpl-1"),
            "123456789012.dkr.ecr.us-west-2.amazonaws.com/templates:tmpl-1"
        );
        for full in ["alpine:3.19", "myorg/app", "localhost:5000/base", "app@sha256:abc"] {
            assert_eq!(config.registry.resolve_image(full), full);
        }
    }

    #[test]
    #[serial_test::serial]
    fn apply_env_reads_process_environment() {
        std::env::set_var("AWS_ECR_REPOSITORY_NAME", "rootfs-templates");
        std::env::set_var("ENVIRONMENT", "dev");

        let mut config = Config::default();
        config.apply_env();

        std::env::remove_var("AWS_ECR_REPOSITORY_NAME");
        std::env::remove_var("ENVIRONMENT");

        assert_eq!(config.registry.repository.as_deref(), Some("rootfs-templates"));
        assert_eq!(config.general.environment, Environment::Dev);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.registry.region = Some("eu-central-1".to_string());
        config.apply_vars(vars(&[("AWS_REGION", "")]));
        assert_eq!(config.registry.region.as_deref(), Some("eu-central-1"));
    }

    #[test]
    fn check_required_reports_every_missing_variable() {
        let mut config = Config::default();
        config.registry.auth = AuthMode::Ecr;
        config.registry.region = Some("us-east-1".to_string());

        match config.check_required() {
            Err(RootsmithError::ConfigMissing(missing)) => {
                assert_eq!(missing, vec!["AWS_ACCOUNT_ID", "AWS_ECR_REPOSITORY_NAME"]);
            }
            other => panic!("expected ConfigMissing, got {:?}", other),
        }
    }

    #[test]
    fn anonymous_auth_requires_nothing() {
        assert!(Config::default().check_required().is_ok());
    }

    #[test]
    fn registry_host_override_wins() {
        let registry = RegistryConfig {
            registry_host: Some("localhost:5000".to_string()),
            account_id: Some("1".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.registry_host().as_deref(), Some("localhost:5000"));
    }
}
