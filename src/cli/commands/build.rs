//! Build command - convert an image into a rootfs and cache it

use crate::audit::{AuditEvent, AuditLog};
use crate::build::{BuildCoordinator, BuildSpec, TemplateBuilder};
use crate::cli::args::BuildArgs;
use crate::cli::commands::format_bytes;
use crate::cli::signal::shutdown_signal;
use crate::config::{Config, ConfigManager};
use crate::diff::DiffCache;
use crate::error::{RootsmithError, RootsmithResult};
use crate::registry::{create_auth_provider, parse_reference, ImageSourceClient, Platform};
use crate::rootfs::{Ext4Writer, Materializer};
use crate::storage::{FsObjectStore, ObjectStore};
use crate::ui::{self, UiContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> RootsmithResult<()> {
    let ctx = UiContext::detect();

    let image = config.registry.resolve_image(&args.image);
    parse_reference(&image)?;
    config.check_required()?;

    let writer = Ext4Writer::new();
    if !writer.is_available() {
        return Err(RootsmithError::Conversion(
            "mke2fs not found in PATH".to_string(),
        ));
    }

    let build_id = args
        .build_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.ext4", build_id)));
    let max_bytes = args
        .max_size_mb
        .map(|mb| mb << 20)
        .unwrap_or_else(|| config.build.max_rootfs_bytes());

    let store: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::new(ConfigManager::storage_root(config)));
    let cache = DiffCache::new(
        ConfigManager::cache_dir(config),
        Arc::clone(&store),
        config.cache.retention(),
        config.cache.eviction_interval(),
    )?;
    let audit = Arc::new(AuditLog::new(config));

    let source = ImageSourceClient::new(
        create_auth_provider(config),
        config.registry.fetch_timeout(),
    );
    let builder = TemplateBuilder::new(
        Arc::new(source),
        Materializer::new(Arc::new(writer)),
        cache.clone(),
        store,
        Platform::from_config(&config.registry),
        config.build.block_size,
    )
    .with_audit(Arc::clone(&audit));
    let coordinator = BuildCoordinator::new(&config.drain, config.general.environment);

    let background = CancellationToken::new();
    let eviction = cache.start(background.clone());

    let build_cancel = CancellationToken::new();
    let timer = args.timeout_secs.map(|secs| {
        let cancel = build_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("Build timed out after {}s", secs);
            cancel.cancel();
        })
    });

    let signal = shutdown_signal();
    let drain = tokio::spawn(drain_on_signal(
        coordinator.clone(),
        Arc::clone(&audit),
        signal.clone(),
    ));

    ui::section(&ctx, "Build");
    ui::key_value(&ctx, "Build", &build_id);
    ui::key_value(&ctx, "Image", &image);
    ui::key_value(&ctx, "Limit", &format_bytes(max_bytes));

    ui::step_info(&ctx, "Pulling image and converting to ext4");
    let spec = BuildSpec::new(&build_id, &image, &output, max_bytes);
    let result = builder.run(&coordinator, spec, &build_cancel).await;

    if let Some(timer) = timer {
        timer.abort();
    }

    if signal.is_cancelled() {
        ui::step_warn(&ctx, "Shutdown requested, draining");
        match drain.await {
            Ok(Ok(())) => debug!("Drain finished"),
            Ok(Err(e)) => warn!("Drain failed: {}", e),
            Err(e) => warn!("Drain task failed: {}", e),
        }
    } else {
        drain.abort();
    }

    background.cancel();
    if let Err(e) = eviction.await {
        warn!("Eviction loop failed: {}", e);
    }
    let pending = cache.close_all().await;
    debug!(pending, "Diff cache closed");

    let output = result?;
    ui::step_ok_detail(&ctx, "Rootfs written", &output.output.display().to_string());
    ui::key_value(&ctx, "Image size", &format_bytes(output.image_size));
    ui::key_value(&ctx, "Rootfs size", &format_bytes(output.rootfs_size));
    ui::key_value(&ctx, "Cache key", &output.diff.cache_key());

    Ok(())
}

/// Run the drain protocol once a termination signal arrives
async fn drain_on_signal(
    coordinator: BuildCoordinator,
    audit: Arc<AuditLog>,
    signal: CancellationToken,
) -> RootsmithResult<()> {
    signal.cancelled().await;

    info!(in_flight = coordinator.in_flight(), "Shutdown requested");
    audit
        .log(
            AuditEvent::DrainStarted,
            &serde_json::json!({ "in_flight": coordinator.in_flight() }),
        )
        .await;

    coordinator.shutdown(&CancellationToken::new()).await?;

    audit
        .log(AuditEvent::DrainCompleted, &serde_json::json!({}))
        .await;
    Ok(())
}
