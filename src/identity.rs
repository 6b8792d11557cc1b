//! The gateway's SSH identity
//!
//! Two Ed25519 keys: a host key presented to connecting clients
//! (generated fresh at startup) and a client key used to authenticate
//! to backend containers. The client key is persisted in the secret
//! store under `gateway-ssh-key` so the container provisioner can keep
//! installing the matching public key; it is generated exactly once,
//! on the first start against an empty store.
//!
//! Both keys are initialized once at startup and injected by
//! constructor; nothing here is resolved lazily inside handshakes.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{decode_secret_key, PrivateKey};
use tracing::info;

use crate::secrets::{SecretData, SecretStore};

/// Name of the secret holding the persisted client key
pub const SECRET_NAME: &str = "gateway-ssh-key";

/// Secret field with the private key in OpenSSH PEM format
pub const PRIVATE_KEY_FIELD: &str = "private_key";

/// Secret field with the public key as an `authorized_keys` line
pub const PUBLIC_KEY_FIELD: &str = "public_key";

/// Process-wide SSH key material
pub struct SshIdentity {
    host_key: PrivateKey,
    client_key: Arc<PrivateKey>,
    public_key_line: String,
}

impl SshIdentity {
    /// Load the client key from the secret store, generating and
    /// persisting a new one when the secret does not exist yet.
    pub async fn init(store: &dyn SecretStore) -> Result<Self> {
        let client_key = match store.get(SECRET_NAME).await? {
            Some(data) => {
                let pem = data
                    .get(PRIVATE_KEY_FIELD)
                    .ok_or_else(|| anyhow!("secret missing {} field", PRIVATE_KEY_FIELD))?;
                let pem = std::str::from_utf8(pem).context("private key is not valid UTF-8")?;
                let key =
                    decode_secret_key(pem, None).context("parse private key from secret")?;
                info!(
                    "loaded gateway SSH key from secret, fingerprint={}",
                    key.public_key().fingerprint(Default::default())
                );
                key
            }
            None => {
                info!("generating new gateway SSH key");
                let key = generate_ed25519()?;
                let pem = key
                    .to_openssh(LineEnding::LF)
                    .context("encode private key")?;
                let public = key
                    .public_key()
                    .to_openssh()
                    .context("encode public key")?;

                let mut data = SecretData::new();
                data.insert(PRIVATE_KEY_FIELD.to_string(), pem.as_bytes().to_vec());
                data.insert(PUBLIC_KEY_FIELD.to_string(), public.into_bytes());
                store
                    .create(SECRET_NAME, data)
                    .await
                    .context("store gateway SSH key")?;

                info!(
                    "created gateway SSH key secret, fingerprint={}",
                    key.public_key().fingerprint(Default::default())
                );
                key
            }
        };

        Self::from_client_key(client_key)
    }

    /// Build an identity with freshly generated keys, nothing persisted.
    pub fn ephemeral() -> Result<Self> {
        Self::from_client_key(generate_ed25519()?)
    }

    fn from_client_key(client_key: PrivateKey) -> Result<Self> {
        let public_key_line = client_key
            .public_key()
            .to_openssh()
            .context("encode public key")?;
        Ok(Self {
            host_key: generate_ed25519()?,
            client_key: Arc::new(client_key),
            public_key_line,
        })
    }

    /// Host key presented to connecting SSH clients
    #[must_use]
    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    /// Key used to authenticate to backend containers
    #[must_use]
    pub fn client_key(&self) -> Arc<PrivateKey> {
        self.client_key.clone()
    }

    /// Public half of the client key in `authorized_keys` format
    #[must_use]
    pub fn authorized_key_line(&self) -> &str {
        &self.public_key_line
    }
}

fn generate_ed25519() -> Result<PrivateKey> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("generate ed25519 key")
}
