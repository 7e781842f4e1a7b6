pub mod config;
pub mod confirm;
pub mod digitalocean;
pub mod fly;
pub mod ssh;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use config::ProviderSettings;
use types::{BootstrapConfig, Instance, MachineSpec, MachineUid, ResolvedSpec};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to decode provider config: {0}")]
    ConfigDecode(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("invalid {provider} machine spec: {reason}")]
    InvalidSpec {
        provider: ProviderName,
        reason: String,
    },

    #[error("no {provider} instance found for machine {uid}")]
    InstanceNotFound {
        provider: ProviderName,
        uid: MachineUid,
    },

    #[error("{provider} rejected creation of {name}: {reason}")]
    CreateRejected {
        provider: ProviderName,
        name: String,
        reason: String,
    },

    #[error(
        "{provider} resource {resource_id} was not confirmed after {waited:?}, it may or may not exist"
    )]
    ConfirmationTimeout {
        provider: ProviderName,
        resource_id: String,
        waited: Duration,
    },

    #[error("confirmation of {provider} resource {resource_id} was cancelled")]
    ConfirmationCancelled {
        provider: ProviderName,
        resource_id: String,
    },

    #[error("ssh keypair secret is corrupt: {0}")]
    KeypairCorrupt(String),

    #[error("secret store error: {0}")]
    SecretStore(#[from] ssh::SecretStoreError),

    #[error("ssh key error: {0}")]
    Key(String),

    #[error("{provider} key registry error: {reason}")]
    KeyRegistry {
        provider: ProviderName,
        reason: String,
    },

    #[error("{provider} {operation} failed: {source}")]
    Transport {
        provider: ProviderName,
        operation: &'static str,
        source: BackendError,
    },

    #[error("invalid setting {name}={value:?}")]
    InvalidSetting { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Underlying API client failure carried by [`Error::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    DigitalOcean(#[from] do_api::Error),

    #[error(transparent)]
    Fly(#[from] fly_api::Error),
}

/// Coarse classification of [`Error`] for callers that branch on outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigDecode,
    InvalidSpec,
    InstanceNotFound,
    CreateRejected,
    ConfirmationTimeout,
    Cancelled,
    KeypairCorrupt,
    BackendTransport,
    Internal,
}

impl ErrorKind {
    /// Whether repeating the same call, unchanged, can reasonably succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BackendTransport)
    }

    /// The backend accepted a create but it was never confirmed, so the
    /// instance may or may not exist. Run `get` before creating again.
    pub fn is_ambiguous(self) -> bool {
        matches!(self, Self::ConfirmationTimeout | Self::Cancelled)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigDecode(_) | Self::UnknownProvider(_) => ErrorKind::ConfigDecode,
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::InstanceNotFound { .. } => ErrorKind::InstanceNotFound,
            Self::CreateRejected { .. } => ErrorKind::CreateRejected,
            Self::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            Self::ConfirmationCancelled { .. } => ErrorKind::Cancelled,
            Self::KeypairCorrupt(_) => ErrorKind::KeypairCorrupt,
            Self::SecretStore(_) | Self::KeyRegistry { .. } | Self::Transport { .. } => {
                ErrorKind::BackendTransport
            }
            Self::Key(_) | Self::InvalidSetting { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::InstanceNotFound
    }

    pub(crate) fn transport(
        provider: ProviderName,
        operation: &'static str,
        source: impl Into<BackendError>,
    ) -> Self {
        Self::Transport {
            provider,
            operation,
            source: source.into(),
        }
    }

    pub(crate) fn invalid(provider: ProviderName, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            provider,
            reason: reason.into(),
        }
    }
}

/// Known cloud backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    DigitalOcean,
    Fly,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DigitalOcean => "digitalocean",
            Self::Fly => "fly",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "digitalocean" => Ok(Self::DigitalOcean),
            "fly" => Ok(Self::Fly),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Uniform lifecycle contract every cloud backend implements.
///
/// Providers hold no per-machine state: credentials and sizing arrive with
/// each [`ResolvedSpec`], and the remote backend is the source of truth for
/// every returned [`Instance`]. Operations for different machines may run
/// concurrently against the same provider.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Check the spec without touching remote state.
    ///
    /// Fails with [`Error::InvalidSpec`] when a required field is empty, the
    /// operating system is unsupported, or the backend reports the requested
    /// placement does not exist.
    async fn validate(&self, spec: &ResolvedSpec) -> Result<()>;

    /// Create the instance and wait until it is identifiable by its uid.
    ///
    /// Never retries the create call itself. A [`Error::ConfirmationTimeout`]
    /// or [`Error::ConfirmationCancelled`] means the outcome is unknown and
    /// the caller must `get` before creating again.
    async fn create(
        &self,
        spec: &ResolvedSpec,
        userdata: &str,
        public_key: &RsaPublicKey,
        cancel: &CancellationToken,
    ) -> Result<Instance>;

    /// Find the instance carrying the machine's name and uid tag.
    async fn get(&self, spec: &ResolvedSpec) -> Result<Instance>;

    /// Delete the instance. Deleting an instance that does not exist succeeds.
    async fn delete(&self, spec: &ResolvedSpec) -> Result<()>;

    /// Backend-specific metadata for the bootstrap payload renderer.
    async fn bootstrap_config(&self, _spec: &ResolvedSpec) -> Result<BootstrapConfig> {
        Ok(BootstrapConfig::default())
    }
}

/// Registry of all known cloud providers, keyed by name.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    /// Registry holding every built-in backend.
    pub fn new(settings: &ProviderSettings) -> Self {
        Self::empty()
            .with_provider(Arc::new(digitalocean::DigitalOceanProvider::new(settings)))
            .with_provider(Arc::new(fly::FlyProvider::new(settings)))
    }

    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Add a provider, replacing any registered under the same name.
    pub fn with_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    /// Look up a provider by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn CloudProvider>> {
        self.providers.get(&name)
    }

    /// List the names of all registered providers.
    pub fn available(&self) -> Vec<ProviderName> {
        self.providers.keys().copied().collect()
    }

    /// Decode the spec's provider config and pick the backend it names.
    pub fn resolve(&self, spec: &MachineSpec) -> Result<(Arc<dyn CloudProvider>, ResolvedSpec)> {
        let resolved = ResolvedSpec::decode(spec)?;
        let name = resolved.config.backend.provider();
        let provider = self
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        Ok((provider, resolved))
    }
}

/// Build the registry from environment settings.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let settings = ProviderSettings::from_env()?;
    let registry = ProviderRegistry::new(&settings);
    tracing::info!(providers = ?registry.available(), "registered cloud providers");
    Ok(registry)
}
