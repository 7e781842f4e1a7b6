use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Machine types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MachineFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_destroy: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    pub cpus: u32,
    pub cpu_kind: String,
    pub memory_mb: u32,
}

/// A file written into the machine's filesystem before boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineFile {
    pub guest_path: String,
    /// Base64-encoded file contents.
    pub raw_value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub state: String,
    pub region: String,
    pub private_ip: Option<String>,
    #[serde(default)]
    pub config: MachineConfig,
}

impl Machine {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.config.metadata.get(key).map(String::as_str)
    }
}

/// Error body returned by the API on non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
}
