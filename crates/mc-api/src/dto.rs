use mc_infra::ProviderName;
use mc_infra::types::{Instance, InstanceState, MachineSpec};
use serde::{Deserialize, Serialize};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MachineRequest {
    pub spec: MachineSpec,
}

#[derive(Debug, Deserialize)]
pub struct CreateMachineRequest {
    pub spec: MachineSpec,
    /// Rendered bootstrap payload.
    #[serde(default)]
    pub userdata: String,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub provider: ProviderName,
    pub id: String,
    pub name: String,
    pub state: InstanceState,
    pub addresses: Vec<String>,
}

impl InstanceResponse {
    pub fn new(provider: ProviderName, instance: Instance) -> Self {
        Self {
            provider,
            id: instance.id.0,
            name: instance.name,
            state: instance.state,
            addresses: instance.addresses,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SshKeyResponse {
    pub authorized_key: String,
    pub fingerprint: String,
}
