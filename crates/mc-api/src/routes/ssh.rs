use axum::Json;
use axum::extract::State;

use crate::dto::SshKeyResponse;
use crate::state::AppState;

pub async fn get_ssh_key(State(state): State<AppState>) -> Json<SshKeyResponse> {
    Json(SshKeyResponse {
        authorized_key: state.ssh.authorized_key.clone(),
        fingerprint: state.ssh.fingerprint.clone(),
    })
}
