//! The control plane's SSH keypair.
//!
//! One RSA keypair grants the control plane access to every machine it
//! creates. The private half lives in a shared secret store under a fixed
//! name; the public half is registered with each backend that keeps a key
//! registry. Both steps tolerate concurrent first-time callers by treating
//! "already exists" as success and re-reading the winner's value.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use ssh_key::HashAlg;
use ssh_key::public::KeyData;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, ProviderName, Result};

/// Secret holding the private key.
pub const SECRET_NAME: &str = "machine-controller-ssh-key";
/// Entry of [`SECRET_NAME`] holding the PEM-encoded private key.
pub const PRIVATE_KEY_DATA_KEY: &str = "id_rsa";
/// Name the public key is registered under in backend key registries.
pub const REGISTERED_KEY_NAME: &str = "machine-controller";
pub const MIN_KEY_BITS: usize = 2048;

// ── Secret store ────────────────────────────────────────────────────

/// A named bag of binary values.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret {0} not found")]
    NotFound(String),

    #[error("secret {0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Backend(String),
}

/// Key-value store for secrets shared by every controller replica.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    async fn get(&self, name: &str) -> std::result::Result<Secret, SecretStoreError>;

    /// Store `secret` only if no secret of that name exists, failing with
    /// [`SecretStoreError::AlreadyExists`] otherwise.
    async fn create(&self, secret: &Secret) -> std::result::Result<(), SecretStoreError>;
}

/// Process-local store, for tests and single-replica deployments.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.secrets.lock().await.len()
    }

    pub async fn insert(&self, secret: Secret) {
        self.secrets.lock().await.insert(secret.name.clone(), secret);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> std::result::Result<Secret, SecretStoreError> {
        self.secrets
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn create(&self, secret: &Secret) -> std::result::Result<(), SecretStoreError> {
        let mut secrets = self.secrets.lock().await;
        if secrets.contains_key(&secret.name) {
            return Err(SecretStoreError::AlreadyExists(secret.name.clone()));
        }
        secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }
}

// ── Keypair bootstrap ───────────────────────────────────────────────

type KeyGenerator = Arc<dyn Fn() -> rsa::Result<RsaPrivateKey> + Send + Sync>;

/// Lazily creates the control plane keypair in a [`SecretStore`].
#[derive(Clone)]
pub struct KeypairBootstrapper {
    store: Arc<dyn SecretStore>,
    generate: KeyGenerator,
}

impl KeypairBootstrapper {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            generate: Arc::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), MIN_KEY_BITS)),
        }
    }

    /// Replace the key generator.
    pub fn with_generator(
        mut self,
        generate: impl Fn() -> rsa::Result<RsaPrivateKey> + Send + Sync + 'static,
    ) -> Self {
        self.generate = Arc::new(generate);
        self
    }

    /// Return the stored keypair, generating and storing one if absent.
    ///
    /// When several callers find the secret absent at once, exactly one
    /// write wins; the others discard their key and use the stored one.
    /// A stored secret that does not hold a valid key fails with
    /// [`Error::KeypairCorrupt`] and is never overwritten.
    pub async fn ensure_keypair(&self) -> Result<RsaPrivateKey> {
        match self.store.get(SECRET_NAME).await {
            Ok(secret) => return key_from_secret(&secret),
            Err(SecretStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!("generating control plane ssh keypair");
        let key = self.generate().await?;

        match self.store.create(&secret_for_key(&key)?).await {
            Ok(()) => {
                info!(fingerprint = %sha256_fingerprint(&key.to_public_key())?, "stored control plane ssh keypair");
                Ok(key)
            }
            Err(SecretStoreError::AlreadyExists(_)) => {
                debug!("ssh keypair was stored concurrently, using the stored one");
                let secret = self.store.get(SECRET_NAME).await?;
                key_from_secret(&secret)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn generate(&self) -> Result<RsaPrivateKey> {
        let generate = self.generate.clone();
        tokio::task::spawn_blocking(move || generate())
            .await
            .map_err(|e| Error::Key(format!("key generation task failed: {e}")))?
            .map_err(|e| Error::Key(format!("failed to generate ssh keypair: {e}")))
    }
}

fn secret_for_key(key: &RsaPrivateKey) -> Result<Secret> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Key(format!("failed to encode private key: {e}")))?;

    Ok(Secret {
        name: SECRET_NAME.to_string(),
        data: BTreeMap::from([(PRIVATE_KEY_DATA_KEY.to_string(), pem.as_bytes().to_vec())]),
    })
}

fn key_from_secret(secret: &Secret) -> Result<RsaPrivateKey> {
    let corrupt = |problem: String| {
        Error::KeypairCorrupt(format!(
            "{problem} in secret '{}', remove it and a new one will be created",
            secret.name
        ))
    };

    let data = secret
        .data
        .get(PRIVATE_KEY_DATA_KEY)
        .ok_or_else(|| corrupt(format!("key data data['{PRIVATE_KEY_DATA_KEY}'] not found")))?;
    let pem = std::str::from_utf8(data).map_err(|_| corrupt("key data is not PEM".into()))?;
    let key = RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|e| corrupt(format!("failed to parse private key ({e})")))?;

    let bits = key.size() * 8;
    if bits < MIN_KEY_BITS {
        return Err(corrupt(format!("private key has only {bits} bits")));
    }
    Ok(key)
}

// ── Public key formats ──────────────────────────────────────────────

fn ssh_public_key(key: &RsaPublicKey) -> Result<ssh_key::PublicKey> {
    let rsa = ssh_key::public::RsaPublicKey::try_from(key)
        .map_err(|e| Error::Key(format!("invalid rsa public key: {e}")))?;
    Ok(ssh_key::PublicKey::from(KeyData::Rsa(rsa)))
}

fn md5_hex(key: &ssh_key::PublicKey) -> Result<String> {
    let blob = key
        .to_bytes()
        .map_err(|e| Error::Key(format!("failed to encode public key: {e}")))?;
    let digest = Md5::digest(&blob);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Public key in `authorized_keys` format.
pub fn authorized_key(key: &RsaPublicKey) -> Result<String> {
    ssh_public_key(key)?
        .to_openssh()
        .map_err(|e| Error::Key(format!("failed to encode public key: {e}")))
}

/// Legacy MD5 fingerprint (`aa:bb:...`), the form key registries index by.
pub fn md5_fingerprint(key: &RsaPublicKey) -> Result<String> {
    md5_hex(&ssh_public_key(key)?)
}

/// `SHA256:...` fingerprint as printed by `ssh-keygen -l`.
pub fn sha256_fingerprint(key: &RsaPublicKey) -> Result<String> {
    Ok(ssh_public_key(key)?.fingerprint(HashAlg::Sha256).to_string())
}

// ── Backend key registries ──────────────────────────────────────────

/// A public key known to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKey {
    pub name: String,
    pub fingerprint: String,
}

/// A backend's SSH public key registry.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    fn provider(&self) -> ProviderName;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredKey>>;

    /// Register `authorized_key` under `name`.
    ///
    /// Returns `None` when the backend reports the key is already registered.
    async fn register(&self, name: &str, authorized_key: &str) -> Result<Option<RegisteredKey>>;
}

/// Make sure `public_key` is registered and return its registry fingerprint.
///
/// Idempotent: an existing entry is reused, and losing a registration race
/// re-reads the entry the winner created.
pub async fn ensure_registered<R>(registry: &R, public_key: &RsaPublicKey) -> Result<String>
where
    R: KeyRegistry + ?Sized,
{
    let fingerprint = md5_fingerprint(public_key)?;
    if let Some(existing) = registry.find_by_fingerprint(&fingerprint).await? {
        return Ok(existing.fingerprint);
    }

    let authorized = authorized_key(public_key)?;
    if let Some(created) = registry.register(REGISTERED_KEY_NAME, &authorized).await? {
        info!(provider = %registry.provider(), fingerprint = %created.fingerprint, "registered ssh public key");
        return Ok(created.fingerprint);
    }

    debug!(provider = %registry.provider(), %fingerprint, "ssh public key registered concurrently, re-reading");
    registry
        .find_by_fingerprint(&fingerprint)
        .await?
        .map(|k| k.fingerprint)
        .ok_or_else(|| Error::KeyRegistry {
            provider: registry.provider(),
            reason: format!("key {fingerprint} reported as registered but cannot be found"),
        })
}
