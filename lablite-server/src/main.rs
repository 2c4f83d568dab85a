use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lablite::config::Config;
use lablite::janitor::Janitor;
use lablite::provider::{ContainerProvider, DockerProvider};
use lablite::session::{MemoryStore, SessionLimits, SessionManager, SessionStore};

use lablite_server::{AppState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let provider: Arc<dyn ContainerProvider> = Arc::new(
        DockerProvider::connect(&config.docker_socket)
            .with_context(|| format!("connecting to docker at {}", config.docker_socket))?,
    );

    let health = provider.health_check().await;
    if health.connected {
        info!(version = health.version.as_deref().unwrap_or("unknown"), "docker connected");
    } else {
        warn!(error = health.error.as_deref().unwrap_or("unknown"), "docker not reachable yet");
    }

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        provider.clone(),
        SessionLimits {
            max_sessions_per_user: config.max_sessions_per_user,
            default_ttl_minutes: config.default_ttl_minutes,
            max_ttl_minutes: lablite::config::MAX_TTL_MINUTES,
        },
    ));

    let shutdown = CancellationToken::new();
    let janitor = Janitor::new(store, provider).spawn(shutdown.clone());

    let config = Arc::new(config);
    let state = AppState::new(manager, config.clone());
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "lab service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!("shutting down");
    shutdown.cancel();
    janitor.await.ok();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
