use cinemashield::modules::media_api::{router, AppState};
use cinemashield::settings::ServerSettings;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = ServerSettings::from_env()?;
    let listen_addr = settings.listen_addr();
    info!(
        "Starting CinemaShield data_dir={} shards={} playback_hours={} remuxer={:?}",
        settings.data_dir.display(),
        settings.total_shards,
        settings.playback_hours,
        settings.remuxer
    );

    let state = Arc::new(AppState::from_settings(settings)?);
    let app = router(state.clone());

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {}", listen_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Sessions and decrypted artifacts never outlive the process
    state.shutdown();

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
