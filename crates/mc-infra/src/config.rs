//! Decoding of the backend-tagged provider config blob, plus the
//! process-level settings every provider shares.
//!
//! The blob is a common envelope naming the backend and operating system,
//! wrapping a backend-specific payload:
//!
//! ```json
//! {
//!   "cloudProvider": "digitalocean",
//!   "cloudProviderSpec": { "token": "...", "region": "fra1", "size": "s-1vcpu-1gb" },
//!   "operatingSystem": "ubuntu"
//! }
//! ```
//!
//! Decoding never checks field values; that is each provider's `validate`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::confirm::ConfirmationPolicy;
use crate::{Error, ProviderName, Result};

/// Fallback for an empty DigitalOcean `token`.
pub const DO_TOKEN_ENV: &str = "DO_TOKEN";
/// Fallback for an empty Fly.io `token`.
pub const FLY_TOKEN_ENV: &str = "FLY_API_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    Ubuntu,
    Coreos,
    Centos,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ubuntu => "ubuntu",
            Self::Coreos => "coreos",
            Self::Centos => "centos",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    cloud_provider: String,
    #[serde(default)]
    cloud_provider_spec: Value,
    operating_system: OperatingSystem,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    operating_system_spec: Value,
}

/// Fully decoded provider config.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedConfig {
    pub operating_system: OperatingSystem,
    /// Opaque, passed through untouched.
    pub operating_system_spec: Value,
    pub backend: BackendConfig,
}

impl DecodedConfig {
    /// Re-encode into the envelope form accepted by [`decode_config`].
    pub fn encode(&self) -> Result<Value> {
        let cloud_provider_spec = match &self.backend {
            BackendConfig::DigitalOcean(c) => serde_json::to_value(c),
            BackendConfig::Fly(c) => serde_json::to_value(c),
        }
        .map_err(|e| Error::ConfigDecode(e.to_string()))?;

        serde_json::to_value(Envelope {
            cloud_provider: self.backend.provider().to_string(),
            cloud_provider_spec,
            operating_system: self.operating_system,
            operating_system_spec: self.operating_system_spec.clone(),
        })
        .map_err(|e| Error::ConfigDecode(e.to_string()))
    }
}

/// Backend-specific config, one variant per provider.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    DigitalOcean(DigitalOceanConfig),
    Fly(FlyConfig),
}

impl BackendConfig {
    pub fn provider(&self) -> ProviderName {
        match self {
            Self::DigitalOcean(_) => ProviderName::DigitalOcean,
            Self::Fly(_) => ProviderName::Fly,
        }
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanConfig {
    pub token: String,
    pub region: String,
    pub size: String,
    pub backups: bool,
    pub ipv6: bool,
    pub private_networking: bool,
    pub tags: Vec<String>,
}

impl DigitalOceanConfig {
    /// The configured token, or `DO_TOKEN` from the environment.
    pub fn resolved_token(&self) -> String {
        resolve_token(&self.token, DO_TOKEN_ENV)
    }
}

impl fmt::Debug for DigitalOceanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanConfig")
            .field("token", &"<redacted>")
            .field("region", &self.region)
            .field("size", &self.size)
            .field("backups", &self.backups)
            .field("ipv6", &self.ipv6)
            .field("private_networking", &self.private_networking)
            .field("tags", &self.tags)
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyConfig {
    pub token: String,
    pub app: String,
    pub region: String,
    /// Overrides the image picked from the operating system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub cpus: u32,
    pub cpu_kind: String,
    pub memory_mb: u32,
    /// Free-form tags, stored as machine metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Default for FlyConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            app: String::new(),
            region: String::new(),
            image: None,
            cpus: 1,
            cpu_kind: "shared".into(),
            memory_mb: 256,
            metadata: BTreeMap::new(),
        }
    }
}

impl FlyConfig {
    /// The configured token, or `FLY_API_TOKEN` from the environment.
    pub fn resolved_token(&self) -> String {
        resolve_token(&self.token, FLY_TOKEN_ENV)
    }
}

impl fmt::Debug for FlyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlyConfig")
            .field("token", &"<redacted>")
            .field("app", &self.app)
            .field("region", &self.region)
            .field("image", &self.image)
            .field("cpus", &self.cpus)
            .field("cpu_kind", &self.cpu_kind)
            .field("memory_mb", &self.memory_mb)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn resolve_token(configured: &str, env_var: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var(env_var).unwrap_or_default()
}

/// Deserialize one part of the config blob.
///
/// serde quotes offending values in its messages, and the value may be a
/// token, so errors name the field and the problem but never the value.
fn decode_part<T: DeserializeOwned>(part: &str, raw: &Value) -> Result<T> {
    T::deserialize(raw).map_err(|e| {
        let field = offending_field::<T>(raw)
            .map(|f| format!(" field {f:?}"))
            .unwrap_or_default();
        Error::ConfigDecode(format!("{part}{field}: {}", redacted_reason(&e)))
    })
}

/// The first field that fails to decode on its own.
fn offending_field<T: DeserializeOwned>(raw: &Value) -> Option<&str> {
    raw.as_object()?.iter().find_map(|(key, value)| {
        let single = Value::Object(Map::from_iter([(key.clone(), value.clone())]));
        match T::deserialize(&single) {
            Err(e) if !e.to_string().starts_with("missing field") => Some(key.as_str()),
            _ => None,
        }
    })
}

fn redacted_reason(e: &serde_json::Error) -> String {
    let msg = e.to_string();
    match msg.rfind(", expected ") {
        // "invalid type: integer `42`, expected a string"
        Some(at) => {
            let category = msg[..at].split([':', '`']).next().unwrap_or_default().trim();
            format!("{category}{}", &msg[at..])
        }
        None if msg.starts_with("missing field") || msg.starts_with("duplicate field") => msg,
        None => "malformed value".to_string(),
    }
}

/// Decode the envelope, then the payload for the backend it names.
pub fn decode_config(raw: &Value) -> Result<DecodedConfig> {
    let envelope: Envelope = decode_part("envelope", raw)?;
    let provider: ProviderName = envelope.cloud_provider.parse()?;

    let part = format!("{provider} spec");
    let payload = &envelope.cloud_provider_spec;
    let backend = match provider {
        ProviderName::DigitalOcean => BackendConfig::DigitalOcean(decode_part(&part, payload)?),
        ProviderName::Fly => BackendConfig::Fly(decode_part(&part, payload)?),
    };

    Ok(DecodedConfig {
        operating_system: envelope.operating_system,
        operating_system_spec: envelope.operating_system_spec,
        backend,
    })
}

/// Settings shared by every provider, read from the environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub confirmation: ConfirmationPolicy,
    pub digitalocean_api_url: Option<String>,
    pub fly_api_url: Option<String>,
}

impl ProviderSettings {
    /// Read from env vars:
    ///
    /// - `MC_CREATE_CHECK_PERIOD_SECS` (default: 10)
    /// - `MC_CREATE_CHECK_TIMEOUT_SECS` (default: 300)
    /// - `MC_CREATE_CHECK_FAILED_WAIT_SECS` (default: 10)
    /// - `DIGITALOCEAN_API_URL` (optional)
    /// - `FLY_API_URL` (optional)
    pub fn from_env() -> Result<Self> {
        let defaults = ConfirmationPolicy::default();

        Ok(Self {
            confirmation: ConfirmationPolicy {
                interval: env_secs("MC_CREATE_CHECK_PERIOD_SECS", defaults.interval)?,
                timeout: env_secs("MC_CREATE_CHECK_TIMEOUT_SECS", defaults.timeout)?,
                failure_backoff: env_secs(
                    "MC_CREATE_CHECK_FAILED_WAIT_SECS",
                    defaults.failure_backoff,
                )?,
            },
            digitalocean_api_url: std::env::var("DIGITALOCEAN_API_URL").ok(),
            fly_api_url: std::env::var("FLY_API_URL").ok(),
        })
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::InvalidSetting { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ErrorKind;

    fn do_blob() -> Value {
        json!({
            "cloudProvider": "digitalocean",
            "cloudProviderSpec": {
                "token": "secret-token",
                "region": "fra1",
                "size": "s-1vcpu-1gb",
                "ipv6": true,
                "tags": ["team-a"]
            },
            "operatingSystem": "ubuntu",
            "operatingSystemSpec": { "distUpgradeOnBoot": false }
        })
    }

    #[test]
    fn decodes_digitalocean_payload() {
        let decoded = decode_config(&do_blob()).unwrap();

        assert_eq!(decoded.operating_system, OperatingSystem::Ubuntu);
        let BackendConfig::DigitalOcean(c) = decoded.backend else {
            panic!("expected digitalocean config");
        };
        assert_eq!(c.region, "fra1");
        assert_eq!(c.size, "s-1vcpu-1gb");
        assert!(c.ipv6);
        assert!(!c.backups);
        assert_eq!(c.tags, vec!["team-a".to_string()]);
    }

    #[test]
    fn fly_payload_gets_defaults() {
        let decoded = decode_config(&json!({
            "cloudProvider": "fly",
            "cloudProviderSpec": { "app": "workers", "region": "ams" },
            "operatingSystem": "ubuntu"
        }))
        .unwrap();

        let BackendConfig::Fly(c) = decoded.backend else {
            panic!("expected fly config");
        };
        assert_eq!(c.cpus, 1);
        assert_eq!(c.cpu_kind, "shared");
        assert_eq!(c.memory_mb, 256);
        assert!(c.image.is_none());
    }

    #[test]
    fn config_round_trips() {
        let first = decode_config(&do_blob()).unwrap();
        let second = decode_config(&first.encode().unwrap()).unwrap();
        assert_eq!(first, second);

        let fly = decode_config(&json!({
            "cloudProvider": "fly",
            "cloudProviderSpec": {
                "token": "t", "app": "workers", "region": "ams", "image": "debian:12",
                "cpus": 2, "cpu_kind": "performance", "memory_mb": 2048,
                "metadata": { "team": "a" }
            },
            "operatingSystem": "centos"
        }))
        .unwrap();
        assert_eq!(fly, decode_config(&fly.encode().unwrap()).unwrap());
    }

    #[test]
    fn unknown_provider_fails_to_decode() {
        let err = decode_config(&json!({
            "cloudProvider": "aws",
            "cloudProviderSpec": {},
            "operatingSystem": "ubuntu"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigDecode);
    }

    #[test]
    fn malformed_payload_fails_to_decode() {
        let err = decode_config(&json!({
            "cloudProvider": "digitalocean",
            "cloudProviderSpec": { "backups": "sometimes" },
            "operatingSystem": "ubuntu"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigDecode);

        let err = decode_config(&json!("not an object")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigDecode);
    }

    #[test]
    fn decode_errors_never_echo_values() {
        let err = decode_config(&json!({
            "cloudProvider": "digitalocean",
            "cloudProviderSpec": { "token": 987654321012u64, "region": "fra1" },
            "operatingSystem": "ubuntu"
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert_eq!(err.kind(), ErrorKind::ConfigDecode);
        assert!(!msg.contains("987654321012"), "{msg}");
        assert!(msg.contains("\"token\""), "{msg}");
        assert!(msg.contains("expected a string"), "{msg}");

        let err = decode_config(&json!({
            "cloudProvider": "fly",
            "cloudProviderSpec": { "app": "workers", "token": ["fo1_secret"] },
            "operatingSystem": "ubuntu"
        }))
        .unwrap_err();
        assert!(!err.to_string().contains("fo1_secret"), "{err}");

        let err = decode_config(&json!({
            "cloudProvider": "digitalocean",
            "operatingSystem": 1234567
        }))
        .unwrap_err();
        assert!(!err.to_string().contains("1234567"), "{err}");
    }

    #[test]
    fn unknown_operating_system_is_left_to_validation() {
        let decoded = decode_config(&json!({
            "cloudProvider": "fly",
            "cloudProviderSpec": {},
            "operatingSystem": "plan9"
        }))
        .unwrap();
        assert_eq!(decoded.operating_system, OperatingSystem::Unknown);
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let decoded = decode_config(&do_blob()).unwrap();
        let rendered = format!("{decoded:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
