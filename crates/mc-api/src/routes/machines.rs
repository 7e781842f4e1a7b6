use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use mc_infra::types::BootstrapConfig;
use tracing::info;

use crate::dto::{CreateMachineRequest, InstanceResponse, MachineRequest};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn validate(
    State(state): State<AppState>,
    Json(req): Json<MachineRequest>,
) -> Result<StatusCode, ApiError> {
    let (provider, spec) = state.providers.resolve(&req.spec)?;
    provider.validate(&spec).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateMachineRequest>,
) -> Result<(StatusCode, Json<InstanceResponse>), ApiError> {
    let (provider, spec) = state.providers.resolve(&req.spec)?;

    // Polling stops on shutdown, and with this future if the client goes away.
    let cancel = state.shutdown.child_token();
    let instance = provider
        .create(&spec, &req.userdata, &state.ssh.public_key, &cancel)
        .await?;

    info!(provider = %provider.name(), machine = %spec.name, uid = %spec.uid, instance_id = %instance.id, "machine created");
    Ok((
        StatusCode::CREATED,
        Json(InstanceResponse::new(provider.name(), instance)),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Json(req): Json<MachineRequest>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let (provider, spec) = state.providers.resolve(&req.spec)?;
    let instance = provider.get(&spec).await?;
    Ok(Json(InstanceResponse::new(provider.name(), instance)))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<MachineRequest>,
) -> Result<StatusCode, ApiError> {
    let (provider, spec) = state.providers.resolve(&req.spec)?;
    provider.delete(&spec).await?;

    info!(provider = %provider.name(), machine = %spec.name, uid = %spec.uid, "machine deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bootstrap_config(
    State(state): State<AppState>,
    Json(req): Json<MachineRequest>,
) -> Result<Json<BootstrapConfig>, ApiError> {
    let (provider, spec) = state.providers.resolve(&req.spec)?;
    Ok(Json(provider.bootstrap_config(&spec).await?))
}
