use serde::{Deserialize, Serialize};

// ── Droplets ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Droplet {
    pub id: i64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub networks: Networks,
}

impl Droplet {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkAddress>,
    #[serde(default)]
    pub v6: Vec<NetworkAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip_address: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    /// Image slug, e.g. `ubuntu-16-04-x64`.
    pub image: String,
    /// SSH key fingerprints (or IDs) to install for root.
    pub ssh_keys: Vec<String>,
    pub backups: bool,
    pub ipv6: bool,
    pub private_networking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DropletEnvelope {
    pub droplet: Droplet,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DropletPage {
    #[serde(default)]
    pub droplets: Vec<Droplet>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Meta {
    pub total: usize,
}

// ── Regions & sizes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub slug: String,
    pub name: String,
    pub available: bool,
    #[serde(default)]
    pub sizes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Size {
    pub slug: String,
    pub available: bool,
    #[serde(default)]
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RegionPage {
    #[serde(default)]
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SizePage {
    #[serde(default)]
    pub sizes: Vec<Size>,
}

// ── SSH keys ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub fingerprint: String,
    pub public_key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyEnvelope {
    pub ssh_key: SshKey,
}

// ── Errors ──────────────────────────────────────────────────────────

/// Error body returned by the API on non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub id: String,
    pub message: String,
}
