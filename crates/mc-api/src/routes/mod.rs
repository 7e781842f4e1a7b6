pub mod machines;
pub mod ssh;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Machine lifecycle
        .route("/v1/machines/validate", post(machines::validate))
        .route("/v1/machines/create", post(machines::create))
        .route("/v1/machines/get", post(machines::get))
        .route("/v1/machines/delete", post(machines::delete))
        .route("/v1/machines/bootstrap-config", post(machines::bootstrap_config))
        // Control plane key
        .route("/v1/ssh-key", get(ssh::get_ssh_key))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(authed)
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(state)
}
