use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dccon_sticker::assembler::PackAssembler;
use dccon_sticker::bot::{self, Dispatcher};
use dccon_sticker::config::BotConfig;
use dccon_sticker::jobs::{JobController, WorkDirs};
use dccon_sticker::logging;
use dccon_sticker::media::{ffmpeg::FfmpegTools, upscaler};
use dccon_sticker::pipeline::AssetPipeline;
use dccon_sticker::source::DcconSource;
use dccon_sticker::telegram::{ChatPlatform, TelegramClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = BotConfig::from_env().context("loading configuration")?;

    // Initialize logging
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.child_token());
    info!(log_dir = %logging_config.log_dir().display(), "Logging initialized");

    let work_dirs = WorkDirs::new(&config.work_dir);
    work_dirs.prepare().await?;

    let telegram = Arc::new(
        TelegramClient::connect(&config.bot_token, config.operator.id)
            .await
            .context("connecting to Telegram")?,
    );
    let platform: Arc<dyn ChatPlatform> = telegram.clone();

    let upscaler = upscaler::from_config(&config.media);
    info!(upscaler = upscaler.name(), "Upscaler selected");
    let pipeline = AssetPipeline::new(
        FfmpegTools::from_config(&config.media),
        Arc::from(upscaler),
        config.encode,
    );
    let assembler = PackAssembler::new(
        Arc::new(DcconSource::new()?),
        Arc::new(pipeline),
        platform.clone(),
    );

    let (controller, reports) = JobController::new(
        config.max_concurrent_jobs,
        Arc::new(assembler),
        work_dirs,
        config.operator.clone(),
    );
    let notifier = tokio::spawn(bot::deliver_reports(platform.clone(), reports));

    let dispatcher = Dispatcher::new(
        platform,
        controller.clone(),
        config.cancel_confirm_timeout,
        shutdown.clone(),
    );

    info!(
        max_jobs = config.max_concurrent_jobs,
        operator = %config.operator.name,
        "dccon-sticker initialized successfully"
    );

    tokio::select! {
        _ = dispatcher.run(telegram.as_ref()) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received, cancelling all jobs");
            let cancelled = controller.cancel_all_unchecked();
            info!(count = cancelled.len(), "Jobs cancelled");
        }
    }

    controller.wait_idle().await;
    shutdown.cancel();
    drop(controller);
    drop(dispatcher);
    if let Err(e) = notifier.await {
        warn!(error = %e, "Report delivery task failed");
    }

    info!("Shut down cleanly");
    Ok(())
}
