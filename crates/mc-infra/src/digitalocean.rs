use async_trait::async_trait;
use do_api::{CreateDropletRequest, CreateKeyRequest, DoClient, Droplet};
use rsa::RsaPublicKey;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BackendConfig, DigitalOceanConfig, OperatingSystem, ProviderSettings};
use crate::confirm::{self, ConfirmationPolicy};
use crate::ssh::{self, KeyRegistry, RegisteredKey};
use crate::types::{Instance, InstanceId, InstanceState, ResolvedSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

const PROVIDER: ProviderName = ProviderName::DigitalOcean;
const MAX_TAG_LEN: usize = 255;

/// DigitalOcean droplets provider.
///
/// The machine uid is attached as a droplet tag, and droplets are looked up
/// by that tag.
pub struct DigitalOceanProvider {
    api_url: Option<String>,
    confirmation: ConfirmationPolicy,
}

impl DigitalOceanProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_url: settings.digitalocean_api_url.clone(),
            confirmation: settings.confirmation,
        }
    }

    fn config(spec: &ResolvedSpec) -> Result<(&DigitalOceanConfig, OperatingSystem)> {
        match &spec.config.backend {
            BackendConfig::DigitalOcean(config) => Ok((config, spec.config.operating_system)),
            other => Err(Error::ConfigDecode(format!(
                "expected a {PROVIDER} config, got {}",
                other.provider()
            ))),
        }
    }

    fn client(&self, config: &DigitalOceanConfig) -> DoClient {
        let client = DoClient::new(config.resolved_token());
        match &self.api_url {
            Some(url) => client.with_base_url(url.clone()),
            None => client,
        }
    }

    fn image_slug(os: OperatingSystem) -> Option<&'static str> {
        match os {
            OperatingSystem::Ubuntu => Some("ubuntu-16-04-x64"),
            OperatingSystem::Coreos => Some("coreos-stable"),
            OperatingSystem::Centos | OperatingSystem::Unknown => None,
        }
    }

    fn parse_state(status: &str) -> InstanceState {
        match status {
            "new" => InstanceState::Starting,
            "active" => InstanceState::Running,
            _ => InstanceState::Stopped,
        }
    }

    /// Droplet tags allow letters, digits, `_`, `-` and `:`.
    fn is_valid_tag(tag: &str) -> bool {
        !tag.is_empty()
            && tag.len() <= MAX_TAG_LEN
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))
    }

    fn instance(droplet: Droplet) -> Instance {
        let addresses = droplet
            .networks
            .v4
            .iter()
            .chain(droplet.networks.v6.iter())
            .map(|n| n.ip_address.clone())
            .collect();

        Instance {
            id: InstanceId(droplet.id.to_string()),
            state: Self::parse_state(&droplet.status),
            name: droplet.name,
            addresses,
        }
    }

    /// The single droplet carrying both the machine's name and uid tag.
    async fn find_droplet(client: &DoClient, spec: &ResolvedSpec) -> Result<Droplet> {
        let uid = spec.uid.as_str();
        let droplets = match client.list_droplets_by_tag(uid).await {
            Ok(droplets) => droplets,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(Error::transport(PROVIDER, "list droplets", e)),
        };

        let mut matches = droplets
            .into_iter()
            .filter(|d| d.name == spec.name && d.has_tag(uid));

        let droplet = matches.next().ok_or_else(|| Error::InstanceNotFound {
            provider: PROVIDER,
            uid: spec.uid.clone(),
        })?;
        if matches.next().is_some() {
            warn!(machine = %spec.name, %uid, "digitalocean: several droplets carry this uid, using the first");
        }
        Ok(droplet)
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn name(&self) -> ProviderName {
        PROVIDER
    }

    async fn validate(&self, spec: &ResolvedSpec) -> Result<()> {
        let (config, os) = Self::config(spec)?;

        if config.resolved_token().is_empty() {
            return Err(Error::invalid(PROVIDER, "token is missing"));
        }
        if config.region.is_empty() {
            return Err(Error::invalid(PROVIDER, "region is missing"));
        }
        if config.size.is_empty() {
            return Err(Error::invalid(PROVIDER, "size is missing"));
        }
        if Self::image_slug(os).is_none() {
            return Err(Error::invalid(
                PROVIDER,
                format!("operating system {os} is not supported"),
            ));
        }
        if !Self::is_valid_tag(spec.uid.as_str()) {
            return Err(Error::invalid(
                PROVIDER,
                format!("machine uid {:?} is not a valid droplet tag", spec.uid.as_str()),
            ));
        }

        let client = self.client(config);

        let regions = client
            .list_regions()
            .await
            .map_err(|e| Error::transport(PROVIDER, "list regions", e))?;
        let region = regions
            .iter()
            .find(|r| r.slug == config.region)
            .ok_or_else(|| Error::invalid(PROVIDER, format!("region {:?} not found", config.region)))?;
        if !region.available {
            return Err(Error::invalid(
                PROVIDER,
                format!("region {:?} is not available", config.region),
            ));
        }

        let sizes = client
            .list_sizes()
            .await
            .map_err(|e| Error::transport(PROVIDER, "list sizes", e))?;
        let size = sizes
            .iter()
            .find(|s| s.slug == config.size)
            .ok_or_else(|| Error::invalid(PROVIDER, format!("size {:?} not found", config.size)))?;
        if !size.available {
            return Err(Error::invalid(
                PROVIDER,
                format!("size {:?} is not available", config.size),
            ));
        }
        if !size.regions.iter().any(|r| *r == config.region) {
            return Err(Error::invalid(
                PROVIDER,
                format!(
                    "size {:?} is not available in region {:?}",
                    config.size, config.region
                ),
            ));
        }

        Ok(())
    }

    async fn create(
        &self,
        spec: &ResolvedSpec,
        userdata: &str,
        public_key: &RsaPublicKey,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        let (config, os) = Self::config(spec)?;
        let image = Self::image_slug(os).ok_or_else(|| {
            Error::invalid(PROVIDER, format!("operating system {os} is not supported"))
        })?;

        let client = self.client(config);
        let fingerprint = ssh::ensure_registered(&client, public_key).await?;

        let uid = spec.uid.as_str();
        let mut tags = config.tags.clone();
        if !tags.iter().any(|t| t == uid) {
            tags.push(uid.to_string());
        }

        let droplet = client
            .create_droplet(&CreateDropletRequest {
                name: spec.name.clone(),
                region: config.region.clone(),
                size: config.size.clone(),
                image: image.into(),
                ssh_keys: vec![fingerprint],
                backups: config.backups,
                ipv6: config.ipv6,
                private_networking: config.private_networking,
                user_data: (!userdata.is_empty()).then(|| userdata.to_string()),
                tags,
            })
            .await
            .map_err(|e| {
                if e.is_rejection() {
                    Error::CreateRejected {
                        provider: PROVIDER,
                        name: spec.name.clone(),
                        reason: e.message(),
                    }
                } else {
                    Error::transport(PROVIDER, "create droplet", e)
                }
            })?;

        info!(droplet_id = droplet.id, machine = %spec.name, %uid, "digitalocean: droplet created, waiting for it to be tagged");

        // Tags only become visible once the droplet is actually running.
        let droplet_id = droplet.id;
        let confirmed = confirm::confirm_creation(
            &self.confirmation,
            cancel,
            || client.get_droplet(droplet_id),
            |d: &Droplet| d.has_tag(uid),
        )
        .await
        .map_err(|u| u.into_error(PROVIDER, droplet_id.to_string()))?;

        info!(droplet_id, machine = %spec.name, "digitalocean: droplet fully created");
        Ok(Self::instance(confirmed))
    }

    async fn get(&self, spec: &ResolvedSpec) -> Result<Instance> {
        let (config, _) = Self::config(spec)?;
        let droplet = Self::find_droplet(&self.client(config), spec).await?;
        Ok(Self::instance(droplet))
    }

    async fn delete(&self, spec: &ResolvedSpec) -> Result<()> {
        let (config, _) = Self::config(spec)?;
        let client = self.client(config);

        let droplet = match Self::find_droplet(&client, spec).await {
            Ok(droplet) => droplet,
            Err(e) if e.is_not_found() => {
                info!(machine = %spec.name, uid = %spec.uid, "digitalocean: droplet already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        client
            .delete_droplet(droplet.id)
            .await
            .map_err(|e| Error::transport(PROVIDER, "delete droplet", e))?;

        info!(droplet_id = droplet.id, machine = %spec.name, "digitalocean: droplet deleted");
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for DoClient {
    fn provider(&self) -> ProviderName {
        PROVIDER
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredKey>> {
        let key = self
            .get_key_by_fingerprint(fingerprint)
            .await
            .map_err(|e| Error::transport(PROVIDER, "get ssh key", e))?;

        Ok(key.map(|k| RegisteredKey {
            name: k.name,
            fingerprint: k.fingerprint,
        }))
    }

    async fn register(&self, name: &str, authorized_key: &str) -> Result<Option<RegisteredKey>> {
        let req = CreateKeyRequest {
            name: name.to_string(),
            public_key: authorized_key.to_string(),
        };

        match self.create_key(&req).await {
            Ok(k) => Ok(Some(RegisteredKey {
                name: k.name,
                fingerprint: k.fingerprint,
            })),
            // "SSH Key is already in use on your account"
            Err(e) if e.is_unprocessable() => Ok(None),
            Err(e) => Err(Error::transport(PROVIDER, "create ssh key", e)),
        }
    }
}
