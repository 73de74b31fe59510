//! KeyFury Back binary entrypoint wiring the WebSocket gateway, HTTP routes and background loops.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use keyfury_back::{
    config::AppConfig,
    dao::{
        kv_store::{KvStore, memory::MemoryStore},
        storage::StorageError,
    },
    routes,
    services::{session_service, storage_supervisor, timer_sync},
    state::{AppState, SharedState},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let app_state = AppState::new(AppConfig::load());

    spawn_storage_supervisor(app_state.clone());
    tokio::spawn(recover_when_ready(app_state.clone()));
    tokio::spawn(timer_sync::run(app_state.clone()));
    tokio::spawn(timer_sync::run_cleanup(app_state.clone()));

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Keep a Redis connection installed when `REDIS_URL` is set, else serve from memory.
#[cfg(feature = "redis-store")]
fn spawn_storage_supervisor(state: SharedState) {
    use keyfury_back::dao::kv_store::redis::{RedisConfig, RedisStore};

    match RedisConfig::from_env() {
        Ok(config) => {
            info!("using Redis storage");
            tokio::spawn(storage_supervisor::run(state, move || {
                let config = config.clone();
                async move {
                    let store = RedisStore::connect(config).await?;
                    Ok::<Arc<dyn KvStore>, StorageError>(Arc::new(store))
                }
            }));
        }
        Err(err) => {
            info!(reason = %err, "using in-memory storage");
            spawn_memory_supervisor(state);
        }
    }
}

#[cfg(not(feature = "redis-store"))]
fn spawn_storage_supervisor(state: SharedState) {
    info!("using in-memory storage");
    spawn_memory_supervisor(state);
}

fn spawn_memory_supervisor(state: SharedState) {
    tokio::spawn(storage_supervisor::run(state, || async {
        Ok::<Arc<dyn KvStore>, StorageError>(Arc::new(MemoryStore::new()))
    }));
}

/// Re-arm rounds left running in the store once storage becomes available.
async fn recover_when_ready(state: SharedState) {
    let mut degraded = state.degraded_watcher();
    if degraded.wait_for(|degraded| !*degraded).await.is_err() {
        return;
    }
    if let Err(err) = session_service::recover_sessions(&state).await {
        warn!(error = %err, "failed to recover running rounds");
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
