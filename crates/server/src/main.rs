use std::{net::SocketAddr, sync::Arc};

use anyhow::{bail, Context};
use broker::MqttBroker;
use coordinator::{
    album::{AlbumSource, ImmichAlbumClient},
    Coordinator,
};
use storage::Storage;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use api::{build_router, AppState};
use config::{load_settings, prepare_database_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let albums: Arc<dyn AlbumSource> = Arc::new(
        ImmichAlbumClient::with_timeout(
            &settings.album_api_url,
            settings.album_api_key.clone(),
            settings.album_timeout(),
        )
        .context("invalid album api url")?,
    );

    let (broker, events, pump) = MqttBroker::connect(&settings.mqtt_config());
    let coordinator = Coordinator::new(
        Arc::new(storage.clone()),
        Arc::new(broker.clone()),
        Arc::clone(&albums),
        settings.coordinator_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut coordinator_task = tokio::spawn(coordinator.run(events, shutdown_rx.clone()));

    let app = build_router(Arc::new(AppState { storage, albums }));
    let addr: SocketAddr = settings
        .http_bind
        .parse()
        .with_context(|| format!("invalid http_bind '{}'", settings.http_bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listening");
    let mut http_shutdown = shutdown_rx;
    let http_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
        joined = &mut coordinator_task => {
            let _ = shutdown_tx.send(true);
            joined.context("coordinator task panicked")??;
            bail!("coordinator loop stopped unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    coordinator_task
        .await
        .context("coordinator task panicked")??;
    http_task.await.context("http task panicked")??;

    if let Err(error) = broker.disconnect().await {
        warn!(%error, "mqtt disconnect failed");
    }
    pump.abort();
    info!("server stopped");
    Ok(())
}
