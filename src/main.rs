//! Coinpusher - live trade ingestion, drift forecasts and websocket fan-out
//!
//! Streams trades from the exchange feed into per-instrument logs, forecasts short-term
//! drift with the trained nets, scores every forecast when it matures, and pushes it all
//! to connected dashboards.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::{path::Path, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coinpusher_backend::{
    api::create_router,
    config::AppConfig,
    model::{LinearTrainer, ModelStore},
    pipeline::Pipeline,
    stream::BitstampFeed,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = AppConfig::from_env();
    info!(
        instruments = config.instruments.len(),
        streams = %config.storage.streams_dir.display(),
        nets = %config.storage.nets_dir.display(),
        "🚀 coinpusher starting"
    );

    let store = Arc::new(ModelStore::new(
        config.storage.nets_dir.clone(),
        Arc::new(LinearTrainer::default()),
    ));
    let feed = BitstampFeed::new(config.feed.url.clone());
    let port = config.server.port;
    let liveness = config.broadcast.liveness_interval();

    let pipeline = Pipeline::new(config, store);
    pipeline
        .preload()
        .await
        .context("failed to preload persisted streams")?;

    let handle = pipeline.start(&feed);
    let sweeper = pipeline.hub().spawn_liveness(liveness);

    let app = create_router(pipeline.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    handle.close().await;
    info!("👋 shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinpusher_backend=debug,coinpusher=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also pick up the crate-local .env when started from elsewhere.
    let local = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if local.exists() {
        let _ = dotenv::from_path(&local);
    }
}
