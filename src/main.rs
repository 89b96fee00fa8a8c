//! Main entry point for the collaboration relay server.
//!
//! Usage: `collab-relay [config.toml]`. Without an argument the path is read
//! from `COLLAB_CONFIG`; without either, built-in defaults are used.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use collab_relay::config::{CacheBackend, Config};
use collab_relay::server::{AppState, ProxyHeaderGate, create_router};
use collab_relay::{
    Channel, ChannelCaches, CollabError, Hub, MemoryCache, Persister, RedisCache, Result, SqliteStore,
    TranscriptMerger, YrsMerger,
};

/// How often empty rooms left behind by evictions are swept.
const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::discover(std::env::args().nth(1))?;
    info!("Starting collaboration relay...");

    let caches = match config.cache.backend {
        CacheBackend::Redis => {
            let documents = RedisCache::connect(&config.cache).await?;
            let notes = documents.with_prefix(config.cache.note_key_prefix.clone());
            ChannelCaches::new(Arc::new(documents), Arc::new(notes))
        }
        CacheBackend::Memory => {
            warn!("Using in-process cache; pending updates do not survive a restart");
            ChannelCaches::new(
                Arc::new(MemoryCache::from_config(&config.cache)),
                Arc::new(MemoryCache::from_config(&config.cache)),
            )
        }
    };
    let store = SqliteStore::open(&config.storage.database_path).await?;

    let hub = Arc::new(Hub::new(caches.clone(), config.client.clone()));
    let sweeper = hub.spawn_sweeper(ROOM_SWEEP_INTERVAL);

    let persisters = [
        Persister::new(
            caches.get(Channel::Document).clone(),
            Arc::new(store.channel(Channel::Document)),
            Arc::new(YrsMerger),
            &config.persister,
        )
        .with_open_documents(Arc::new(hub.open_rooms(Channel::Document))),
        Persister::new(
            caches.get(Channel::Note).clone(),
            Arc::new(store.channel(Channel::Note)),
            Arc::new(TranscriptMerger),
            &config.persister,
        )
        .with_open_documents(Arc::new(hub.open_rooms(Channel::Note))),
    ]
    .map(Arc::new);
    for persister in &persisters {
        persister.start();
    }

    let app = create_router(AppState {
        hub: hub.clone(),
        gate: Arc::new(ProxyHeaderGate::new(config.auth.require_user)),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!("Server listening on http://{}", listener.local_addr()?);
    info!("  GET /health               - Health check");
    info!("  GET /ws/stats             - Room statistics");
    info!("  WS  /ws/docs/:id          - Binary document relay");
    info!("  WS  /ws/notes/:id         - Text note relay");
    info!("  WS  /ws/public/docs/:id   - Read-only document relay");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    sweeper.abort();
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        hub.shutdown().await;
        for persister in &persisters {
            let report = persister.force_persist().await;
            if !report.is_clean() {
                warn!(failed = report.failures.len(), "Final persistence pass incomplete");
            }
            persister.stop().await;
        }
        store.close().await;
    })
    .await;

    match drained {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(_) => {
            error!(grace_secs = grace.as_secs(), "Shutdown did not finish in time");
            Err(CollabError::Config("shutdown grace period exceeded".into()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
