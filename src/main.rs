use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use telestream::activity::ActivityTracker;
use telestream::config::{self, Args};
use telestream::metadata::store::MetadataStore;
use telestream::metadata::tmdb::TmdbClient;
use telestream::metadata::worker::MetadataWorker;
use telestream::probe::MediaProbe;
use telestream::remote::{ChunkCache, HttpRemoteClient, RemoteClient};
use telestream::subtitle::SubtitleExtractor;
use telestream::sync::SyncLoop;
use telestream::transcode::TranscodeSupervisor;
use telestream::{create_app, create_internal_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = config::load(&args)?;
    info!(config = args.config, "configuration loaded");

    let host = settings.server.host.clone();
    let port = settings.server.port;
    let internal_port = settings.server.internal_port;
    let internal_base_url = format!("http://127.0.0.1:{internal_port}");

    let remote: Arc<dyn RemoteClient> =
        Arc::new(HttpRemoteClient::new(&settings.remote, settings.remote.base_url.clone()));
    let chunk_cache = Arc::new(ChunkCache::new(remote.clone(), settings.streaming.max_cache_size));
    let probe = Arc::new(MediaProbe::new(chunk_cache.clone()));
    let tmdb = Arc::new(TmdbClient::new(
        settings.metadata_api_key.clone(),
        settings.metadata.base_url.clone(),
        settings.metadata.image_base_url.clone(),
    ));
    let activity = ActivityTracker::new();

    let metadata_store = Arc::new(MetadataStore::new(&settings.streaming.data_dir));
    metadata_store.ensure_dirs().await?;

    let worker = Arc::new(MetadataWorker::new(
        metadata_store.clone(),
        tmdb,
        remote.clone(),
        probe.clone(),
        activity.clone(),
    ));
    let sync_loop = Arc::new(SyncLoop::new(
        metadata_store.clone(),
        remote.clone(),
        worker.clone(),
        activity.clone(),
        &settings.streaming.data_dir,
    )?);
    tokio::spawn(sync_loop.clone().run());

    let transcode = Arc::new(TranscodeSupervisor::new(internal_base_url.clone()));
    let subtitle = Arc::new(SubtitleExtractor::new(internal_base_url));

    let state = Arc::new(AppState {
        config: settings,
        remote,
        chunk_cache,
        probe,
        metadata_store,
        worker,
        sync_loop,
        activity,
        transcode: transcode.clone(),
        subtitle,
    });

    let public_app = create_app(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let internal_app = create_internal_app(state).into_make_service_with_connect_info::<SocketAddr>();

    let public_addr = format!("{host}:{port}");
    let internal_addr = format!("127.0.0.1:{internal_port}");
    let public_listener = tokio::net::TcpListener::bind(&public_addr).await?;
    let internal_listener = tokio::net::TcpListener::bind(&internal_addr).await?;
    info!(addr = public_addr, "public listener bound");
    info!(addr = internal_addr, "internal loopback listener bound");

    let public_server = axum::serve(public_listener, public_app).with_graceful_shutdown(shutdown_signal());
    let internal_server = axum::serve(internal_listener, internal_app).with_graceful_shutdown(shutdown_signal());

    let result = tokio::try_join!(
        async { public_server.await.map_err(anyhow::Error::from) },
        async { internal_server.await.map_err(anyhow::Error::from) },
    );

    transcode.kill_all().await;
    if let Err(e) = result {
        error!(error = %e, "server exited with an error");
        return Err(e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing Ctrl+C handler failed");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
