//! Size command - report the compressed size of an image

use crate::cli::args::SizeArgs;
use crate::cli::commands::format_bytes;
use crate::cli::signal::shutdown_signal;
use crate::config::Config;
use crate::error::RootsmithResult;
use crate::registry::{
    create_auth_provider, image_size, parse_reference, ImageSource, ImageSourceClient, Platform,
};
use crate::ui::{self, UiContext};

/// Execute the size command
pub async fn execute(args: SizeArgs, config: &Config) -> RootsmithResult<()> {
    let reference = config.registry.resolve_image(&args.image);
    parse_reference(&reference)?;
    config.check_required()?;

    let source = ImageSourceClient::new(
        create_auth_provider(config),
        config.registry.fetch_timeout(),
    );
    let platform = Platform::from_config(&config.registry);
    let cancel = shutdown_signal();

    let image = source.fetch_image(&reference, &platform, &cancel).await?;
    let size = image_size(&image)?;

    if args.bytes {
        println!("{}", size);
        return Ok(());
    }

    let ctx = UiContext::detect();
    ui::step_ok_detail(&ctx, &reference, &platform.to_string());
    ui::key_value(&ctx, "Layers", &image.layers.len().to_string());
    ui::key_value(&ctx, "Compressed size", &format_bytes(size));

    Ok(())
}
