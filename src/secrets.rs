//! Cluster secret storage for the gateway's persisted SSH key
//!
//! The gateway impersonates users toward backends with a single key pair
//! whose private half must survive restarts. `SecretStore` abstracts
//! where that key lives: a directory on disk by default, or a Kubernetes
//! Secret when built with the `kube` feature.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Field name -> raw bytes of one named secret
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Backend-agnostic access to named secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name; `None` when it does not exist.
    async fn get(&self, name: &str) -> Result<Option<SecretData>>;

    /// Create a secret. Fails if it already exists.
    async fn create(&self, name: &str, data: SecretData) -> Result<()>;
}

/// Stores each secret as a directory of field files under a root path
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretData>> {
        let dir = self.root.join(name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read secret dir {:?}", dir)),
        };

        let mut data = SecretData::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("list secret dir {:?}", dir))?
        {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let field = entry.file_name().to_string_lossy().into_owned();
            let bytes = tokio::fs::read(entry.path())
                .await
                .with_context(|| format!("read secret field {:?}", entry.path()))?;
            data.insert(field, bytes);
        }

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(data))
    }

    async fn create(&self, name: &str, data: SecretData) -> Result<()> {
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create secret dir {:?}", dir))?;

        for (field, bytes) in data {
            let path = dir.join(&field);
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("write secret field {:?}", path))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(&path, perms)
                    .with_context(|| format!("set permissions on {:?}", path))?;
            }
        }
        Ok(())
    }
}

/// Stores secrets as Kubernetes `Secret` objects in a fixed namespace
#[cfg(feature = "kube")]
pub struct KubeSecretStore {
    api: kube::Api<k8s_openapi::api::core::v1::Secret>,
}

#[cfg(feature = "kube")]
impl KubeSecretStore {
    /// Connect using in-cluster configuration (or the local kubeconfig).
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .context("create kubernetes client")?;
        Ok(Self {
            api: kube::Api::namespaced(client, namespace),
        })
    }
}

#[cfg(feature = "kube")]
#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretData>> {
        let secret = self
            .api
            .get_opt(name)
            .await
            .with_context(|| format!("get secret {}", name))?;
        Ok(secret.and_then(|s| s.data).map(|data| {
            data.into_iter()
                .map(|(field, bytes)| (field, bytes.0))
                .collect()
        }))
    }

    async fn create(&self, name: &str, data: SecretData) -> Result<()> {
        use k8s_openapi::api::core::v1::Secret;
        use k8s_openapi::ByteString;
        use kube::api::PostParams;

        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "gateway".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(field, bytes)| (field, ByteString(bytes)))
                    .collect(),
            ),
            ..Default::default()
        };

        self.api
            .create(&PostParams::default(), &secret)
            .await
            .with_context(|| format!("create secret {}", name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());

        assert!(store.get("gateway-ssh-key").await.unwrap().is_none());

        let mut data = SecretData::new();
        data.insert("private_key".to_string(), b"PRIVATE".to_vec());
        data.insert("public_key".to_string(), b"ssh-ed25519 AAA".to_vec());
        store.create("gateway-ssh-key", data.clone()).await.unwrap();

        let loaded = store.get("gateway-ssh-key").await.unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());

        let mut data = SecretData::new();
        data.insert("private_key".to_string(), b"PRIVATE".to_vec());
        store.create("k", data).await.unwrap();

        let meta = std::fs::metadata(dir.path().join("k/private_key")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
