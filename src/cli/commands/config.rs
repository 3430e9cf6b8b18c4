//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{RootsmithError, RootsmithResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "general.audit_log",
    "general.environment",
    "registry.auth",
    "registry.account_id",
    "registry.region",
    "registry.repository",
    "registry.registry_host",
    "registry.profile",
    "registry.platform_os",
    "registry.platform_arch",
    "registry.fetch_timeout_secs",
    "cache.dir",
    "cache.retention_hours",
    "cache.eviction_interval_secs",
    "build.max_rootfs_mb",
    "build.block_size",
    "drain.announce_delay_secs",
    "drain.final_delay_secs",
    "storage.root",
];

/// Execute the config command
pub async fn execute(
    args: ConfigArgs,
    config: &Config,
    manager: &ConfigManager,
) -> RootsmithResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let ctx = UiContext::detect();
            let mut updated = config.clone();
            if let Err(e) = set_value(&mut updated, &key, &value) {
                if matches!(&e, RootsmithError::ConfigValue { reason, .. } if reason == "unknown key")
                {
                    ui::step_error_detail(&ctx, "Unknown config key", &key);
                    ui::remark(&ctx, "Valid keys:");
                    for key in VALID_KEYS {
                        eprintln!("  {}", key);
                    }
                }
                return Err(e);
            }
            manager.save(&updated).await?;
            ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> RootsmithResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> RootsmithResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());

    Ok(())
}

/// Apply a dot-separated key to the configuration
fn set_value(config: &mut Config, key: &str, value: &str) -> RootsmithResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => return Err(invalid(key, "expected text or json")),
        },
        ["general", "audit_log"] => config.general.audit_log = parse_bool(key, value)?,
        ["general", "environment"] => {
            config.general.environment = value
                .parse()
                .map_err(|_| invalid(key, "expected local, dev or prod"))?
        }

        ["registry", "auth"] => {
            config.registry.auth = match value {
                "anonymous" => crate::config::AuthMode::Anonymous,
                "ecr" => crate::config::AuthMode::Ecr,
                _ => return Err(invalid(key, "expected anonymous or ecr")),
            }
        }
        ["registry", "account_id"] => config.registry.account_id = optional(value),
        ["registry", "region"] => config.registry.region = optional(value),
        ["registry", "repository"] => config.registry.repository = optional(value),
        ["registry", "registry_host"] => config.registry.registry_host = optional(value),
        ["registry", "profile"] => config.registry.profile = optional(value),
        ["registry", "platform_os"] => config.registry.platform_os = value.to_string(),
        ["registry", "platform_arch"] => config.registry.platform_arch = value.to_string(),
        ["registry", "fetch_timeout_secs"] => {
            config.registry.fetch_timeout_secs = parse_u64(key, value)?
        }

        ["cache", "dir"] => config.cache.dir = optional(value).map(PathBuf::from),
        ["cache", "retention_hours"] => config.cache.retention_hours = parse_u64(key, value)?,
        ["cache", "eviction_interval_secs"] => {
            config.cache.eviction_interval_secs = parse_u64(key, value)?
        }

        ["build", "max_rootfs_mb"] => config.build.max_rootfs_mb = parse_u64(key, value)?,
        ["build", "block_size"] => match parse_u64(key, value)? {
            0 => return Err(invalid(key, "must be positive")),
            n => config.build.block_size = n,
        },

        ["drain", "announce_delay_secs"] => {
            config.drain.announce_delay_secs = parse_u64(key, value)?
        }
        ["drain", "final_delay_secs"] => config.drain.final_delay_secs = parse_u64(key, value)?,

        ["storage", "root"] => config.storage.root = optional(value).map(PathBuf::from),

        _ => return Err(invalid(key, "unknown key")),
    }

    Ok(())
}

fn invalid(key: &str, reason: &str) -> RootsmithError {
    RootsmithError::ConfigValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Empty string clears an optional value
fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(key: &str, value: &str) -> RootsmithResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, "expected true or false")),
    }
}

fn parse_u64(key: &str, value: &str) -> RootsmithResult<u64> {
    value.parse().map_err(|_| invalid(key, "expected a number"))
}
