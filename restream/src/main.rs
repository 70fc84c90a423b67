use std::sync::Arc;

use restream::api::{ApiServer, AppState};
use restream::capture::ProcessCaptureProvider;
use restream::config::AppConfig;
use restream::logging;
use restream::session::SessionRegistry;
use restream::transcoder::FfmpegLauncher;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default();
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;
    config.log();

    let launcher = FfmpegLauncher::new(config.transcoder.clone());
    match launcher.version() {
        Some(version) => tracing::info!("Using {}", version),
        None => tracing::warn!(
            path = %config.transcoder.binary_path,
            "Could not detect ffmpeg version"
        ),
    }

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(ProcessCaptureProvider::new(config.capture.clone())),
        Arc::new(launcher),
        config.session.clone(),
        config.server.public_base_url(),
    ));

    let sweeper_cancel = CancellationToken::new();
    let sweeper = registry.spawn_idle_sweeper(sweeper_cancel.clone());

    let server = ApiServer::with_state(config.server.clone(), AppState::new(Arc::clone(&registry)));
    let server_cancel = server.cancel_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        server_cancel.cancel();
    });

    let result = server.run().await;

    sweeper_cancel.cancel();
    let _ = sweeper.await;
    registry.shutdown().await;

    result?;
    tracing::info!("restream stopped");
    Ok(())
}
