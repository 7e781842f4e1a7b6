use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::{DecodedConfig, decode_config};

/// Process-wide unique machine identifier, assigned once and never reused.
///
/// Attached to every created resource as a backend-native tag; it is the
/// only reliable key for finding that resource again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineUid(pub String);

impl MachineUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque provider-side instance identifier (e.g. droplet ID or Fly Machine ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-owned machine specification, immutable for one reconcile pass.
#[derive(Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub uid: MachineUid,
    /// Backend-tagged config blob, see [`crate::config::decode_config`].
    pub provider_config: serde_json::Value,
}

// The provider config carries credentials.
impl fmt::Debug for MachineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineSpec")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

/// A [`MachineSpec`] whose provider config has been decoded.
///
/// Produced once per call by [`crate::ProviderRegistry::resolve`]; providers
/// only ever see this form.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub name: String,
    pub uid: MachineUid,
    pub config: DecodedConfig,
}

impl ResolvedSpec {
    pub fn decode(spec: &MachineSpec) -> Result<Self> {
        Ok(Self {
            name: spec.name.clone(),
            uid: spec.uid.clone(),
            config: decode_config(&spec.provider_config)?,
        })
    }
}

/// Instance status and metadata as reported by the backend.
///
/// Built fresh on every call, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    /// May be empty while the instance is starting.
    pub addresses: Vec<String>,
}

/// Normalized instance state.
///
/// Backends add statuses without notice, so every unrecognized status maps
/// to `Stopped`, which means "not usable", never "definitely gone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Stopped,
}

/// Metadata consumed by the external bootstrap payload renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub cloud_config: String,
    pub name: String,
}
