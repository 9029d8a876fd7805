//! Registry-wide package name index
//!
//! A single JSON array blob (`packages-list.json`) recording known
//! package names, cached in memory after first read. Mutation is a
//! lock-guarded read-modify-write; the cache is updated only after a
//! successful persist, so cache and blob never diverge once a
//! mutating call returns.

use std::sync::Arc;

use blobstore::BlobClient;
use camino::Utf8PathBuf;
use parking_lot::Mutex;

use crate::error::StorageResult;
use crate::mutex::KeyedMutex;
use crate::paths;

/// The lock key guarding index mutations.
const INDEX_LOCK: &str = "packages-list";

/// The registry's package name index.
#[derive(Debug, Clone)]
pub struct PackageIndex {
    client: Arc<dyn BlobClient>,
    mutex: KeyedMutex,
    key: Utf8PathBuf,
    cache: Arc<Mutex<Option<Vec<String>>>>,
}

impl PackageIndex {
    pub(crate) fn new(
        client: Arc<dyn BlobClient>,
        mutex: KeyedMutex,
        prefix: Option<&camino::Utf8Path>,
    ) -> Self {
        Self {
            client,
            mutex,
            key: paths::registry_key(prefix, paths::INDEX_FILE),
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Fetch the current list from the backing blob, treating absence
    /// as an empty index. Does not touch the cache.
    async fn fetch(&self) -> StorageResult<Vec<String>> {
        match self.client.download_to_memory(&self.key).await {
            Ok(bytes) => {
                let names = serde_json::from_slice(&bytes)?;
                Ok(names)
            }
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => {
                tracing::error!(key = %self.key, %err, "package index download failed");
                Err(err.into())
            }
        }
    }

    /// The current list, from the cache when populated.
    async fn current(&self) -> StorageResult<Vec<String>> {
        if let Some(names) = self.cache.lock().clone() {
            return Ok(names);
        }
        self.fetch().await
    }

    /// Serialize and upload the list, then commit it to the cache.
    ///
    /// A failed persist leaves the cache at its pre-call value.
    async fn persist(&self, names: Vec<String>) -> StorageResult<()> {
        let bytes = serde_json::to_vec(&names)?;
        let length = bytes.len() as u64;

        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        self.client
            .upload(&self.key, &mut reader, Some(length))
            .await
            .inspect_err(|err| {
                tracing::error!(key = %self.key, %err, "package index upload failed");
            })?;

        *self.cache.lock() = Some(names);
        Ok(())
    }

    /// All known package names, in insertion order.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        if let Some(names) = self.cache.lock().clone() {
            return Ok(names);
        }

        self.mutex
            .acquire(INDEX_LOCK, async {
                let names = self.fetch().await?;
                *self.cache.lock() = Some(names.clone());
                Ok(names)
            })
            .await
    }

    /// Add a package name; a no-op if it is already present.
    pub async fn add(&self, name: &str) -> StorageResult<()> {
        paths::validate_package(name)?;

        self.mutex
            .acquire(INDEX_LOCK, async {
                let mut names = self.current().await?;
                if names.iter().any(|existing| existing == name) {
                    return Ok(());
                }
                names.push(name.to_string());
                self.persist(names).await
            })
            .await
    }

    /// Remove a package name; a warned no-op if it is absent.
    pub async fn remove(&self, name: &str) -> StorageResult<()> {
        self.mutex
            .acquire(INDEX_LOCK, async {
                let mut names = self.current().await?;
                let before = names.len();
                names.retain(|existing| existing != name);
                if names.len() == before {
                    tracing::warn!(%name, "package not present in index");
                    return Ok(());
                }
                self.persist(names).await
            })
            .await
    }
}
