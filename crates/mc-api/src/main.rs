mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use mc_infra::ssh::{KeypairBootstrapper, MemorySecretStore, SecretStore};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::{AppState, SshIdentity};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Secret store for the control plane keypair
    let store: Arc<dyn SecretStore> = match &config.database_url {
        Some(url) => {
            let db = mc_db::create_pool(url)
                .await
                .expect("failed to connect to database");
            mc_db::run_migrations(&db)
                .await
                .expect("failed to run migrations");
            Arc::new(mc_db::PgSecretStore::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, the ssh keypair will not survive a restart");
            Arc::new(MemorySecretStore::new())
        }
    };

    let key = KeypairBootstrapper::new(store)
        .ensure_keypair()
        .await
        .expect("failed to load ssh keypair");
    let ssh = SshIdentity::new(key.to_public_key()).expect("failed to encode ssh public key");
    tracing::info!(fingerprint = %ssh.fingerprint, "ssh keypair ready");

    // Cloud providers
    let providers = mc_infra::build_providers().expect("failed to build cloud providers");

    let shutdown = CancellationToken::new();
    let state = AppState {
        providers,
        ssh: Arc::new(ssh),
        config: config.clone(),
        shutdown: shutdown.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting machine controller API");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("server error");
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down, cancelling pending creates");
    shutdown.cancel();
}
