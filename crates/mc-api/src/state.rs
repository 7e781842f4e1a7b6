use std::sync::Arc;

use mc_infra::ProviderRegistry;
use rsa::RsaPublicKey;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub providers: ProviderRegistry,
    pub ssh: Arc<SshIdentity>,
    pub config: AppConfig,
    /// Cancelled on shutdown; create calls poll on child tokens of it.
    pub shutdown: CancellationToken,
}

/// Public half of the control plane keypair, in the forms handed out.
pub struct SshIdentity {
    pub public_key: RsaPublicKey,
    pub authorized_key: String,
    pub fingerprint: String,
}

impl SshIdentity {
    pub fn new(public_key: RsaPublicKey) -> mc_infra::Result<Self> {
        Ok(Self {
            authorized_key: mc_infra::ssh::authorized_key(&public_key)?,
            fingerprint: mc_infra::ssh::md5_fingerprint(&public_key)?,
            public_key,
        })
    }
}
