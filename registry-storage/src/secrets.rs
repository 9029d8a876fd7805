//! Registry signing secret storage
//!
//! A single blob (`secret`) holding the registry-wide signing secret,
//! loaded lazily and cached for the life of the adapter instance. The
//! cache is `Option<Secret>` so an empty secret is distinct from "not
//! yet loaded".

use std::sync::Arc;

use blobstore::BlobClient;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use secret::Secret;

use crate::error::StorageResult;
use crate::mutex::KeyedMutex;
use crate::paths;

/// The lock key guarding secret loads and stores.
const SECRET_LOCK: &str = "secret";

/// Storage for the registry signing secret.
#[derive(Debug, Clone)]
pub struct SecretStore {
    client: Arc<dyn BlobClient>,
    mutex: KeyedMutex,
    key: Utf8PathBuf,
    cache: Arc<Mutex<Option<Secret>>>,
}

impl SecretStore {
    pub(crate) fn new(
        client: Arc<dyn BlobClient>,
        mutex: KeyedMutex,
        prefix: Option<&camino::Utf8Path>,
    ) -> Self {
        Self {
            client,
            mutex,
            key: paths::registry_key(prefix, paths::SECRET_FILE),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// The signing secret, loading and caching it on first use.
    ///
    /// An absent blob yields an empty secret; the cache is trusted
    /// thereafter until the process restarts.
    pub async fn get(&self) -> StorageResult<Secret> {
        if let Some(secret) = self.cache.lock().clone() {
            return Ok(secret);
        }

        self.mutex
            .acquire(SECRET_LOCK, async {
                // Re-check under the lock: a racing get may have
                // populated the cache already.
                if let Some(secret) = self.cache.lock().clone() {
                    return Ok(secret);
                }

                let exists = self.client.exists(&self.key).await.inspect_err(|err| {
                    tracing::error!(key = %self.key, %err, "secret existence check failed");
                })?;
                if !exists {
                    return Ok(Secret::empty());
                }

                let bytes = self
                    .client
                    .download_to_memory(&self.key)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(key = %self.key, %err, "secret download failed");
                    })?;
                let secret = Secret::from(String::from_utf8_lossy(&bytes).into_owned());

                *self.cache.lock() = Some(secret.clone());
                Ok(secret)
            })
            .await
    }

    /// Store the signing secret, updating the cache only after the
    /// upload succeeds.
    pub async fn set(&self, secret: Secret) -> StorageResult<()> {
        self.mutex
            .acquire(SECRET_LOCK, async {
                let bytes = secret.revealed().as_bytes().to_vec();
                let length = bytes.len() as u64;

                let mut reader = tokio::io::BufReader::new(&bytes[..]);
                self.client
                    .upload(&self.key, &mut reader, Some(length))
                    .await
                    .inspect_err(|err| {
                        tracing::error!(key = %self.key, %err, "secret upload failed");
                    })?;

                *self.cache.lock() = Some(secret);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobstore::MemoryBlobStore;

    fn store() -> SecretStore {
        SecretStore::new(
            Arc::new(MemoryBlobStore::new()),
            KeyedMutex::new(),
            None,
        )
    }

    #[tokio::test]
    async fn absent_secret_is_empty() {
        let secrets = store();
        assert!(secrets.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let secrets = store();
        secrets.set(Secret::from_str("hunter2")).await.unwrap();
        assert_eq!(secrets.get().await.unwrap().revealed(), "hunter2");
    }

    #[tokio::test]
    async fn set_synchronizes_cache_and_blob() {
        let client = Arc::new(MemoryBlobStore::new());
        let secrets = SecretStore::new(client.clone(), KeyedMutex::new(), None);

        secrets.set(Secret::from_str("original")).await.unwrap();
        secrets.set(Secret::from_str("rotated")).await.unwrap();
        assert_eq!(secrets.get().await.unwrap().revealed(), "rotated");

        // A fresh instance reads the persisted value.
        let fresh = SecretStore::new(client, KeyedMutex::new(), None);
        assert_eq!(fresh.get().await.unwrap().revealed(), "rotated");
    }
}
