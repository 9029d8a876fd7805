//! Package manifest storage
//!
//! One JSON blob per package, at `<package>/package.json`. The
//! manifest is opaque payload: no internal invariants are enforced
//! here. Mutation goes through [`ManifestStore::update`], which
//! serializes concurrent read-modify-write attempts per file under
//! the adapter's keyed mutex.

use std::future::Future;
use std::sync::Arc;

use blobstore::BlobClient;
use camino::Utf8PathBuf;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::mutex::KeyedMutex;
use crate::paths::{self, MANIFEST_FILE};

/// Reads and writes the manifest blob for a single package.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    client: Arc<dyn BlobClient>,
    mutex: KeyedMutex,
    package: String,
    prefix: Option<Utf8PathBuf>,
}

impl ManifestStore {
    pub(crate) fn new(
        client: Arc<dyn BlobClient>,
        mutex: KeyedMutex,
        package: String,
        prefix: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            client,
            mutex,
            package,
            prefix,
        }
    }

    /// The package this store belongs to.
    pub fn package(&self) -> &str {
        &self.package
    }

    fn key(&self, file: &str) -> StorageResult<Utf8PathBuf> {
        paths::object_key(self.prefix.as_deref(), &self.package, file)
    }

    /// Whether the manifest blob is present.
    ///
    /// Errors other than "not found" propagate.
    pub async fn exists(&self) -> StorageResult<bool> {
        let key = self.key(MANIFEST_FILE)?;
        self.client
            .exists(&key)
            .await
            .inspect_err(|err| tracing::error!(package = %self.package, %err, "manifest existence check failed"))
            .map_err(StorageError::from)
    }

    /// Download and deserialize the manifest.
    ///
    /// Absence is surfaced as [`StorageError::FileNotFound`] so the
    /// host can render a 404-equivalent outcome.
    pub async fn read(&self) -> StorageResult<Value> {
        let key = self.key(MANIFEST_FILE)?;
        let bytes = self
            .client
            .download_to_memory(&key)
            .await
            .inspect_err(|err| {
                if !err.is_not_found() {
                    tracing::error!(package = %self.package, %err, "manifest download failed");
                }
            })
            .map_err(StorageError::for_file(key.to_string()))?;

        let manifest = serde_json::from_slice(&bytes)?;
        Ok(manifest)
    }

    /// Serialize and upload the manifest, fully overwriting the blob.
    pub async fn save(&self, manifest: &Value) -> StorageResult<()> {
        let key = self.key(MANIFEST_FILE)?;
        let bytes = serde_json::to_vec(manifest)?;
        let length = bytes.len() as u64;

        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        self.client
            .upload(&key, &mut reader, Some(length))
            .await
            .inspect_err(
                |err| tracing::error!(package = %self.package, %err, "manifest upload failed"),
            )?;

        Ok(())
    }

    /// Create the manifest, refusing to overwrite an existing one.
    pub async fn create(&self, manifest: &Value) -> StorageResult<()> {
        let key = self.key(MANIFEST_FILE)?;
        self.mutex
            .acquire(key.as_str(), async {
                if self.exists().await? {
                    return Err(StorageError::FileExists(key.to_string()));
                }
                self.save(manifest).await
            })
            .await
    }

    /// Read the manifest and apply an asynchronous transform under
    /// the package's lock, returning the transformed document.
    ///
    /// The result is *not* persisted here: the host inspects or
    /// merges it and commits via [`save`](ManifestStore::save). This
    /// split is part of the storage contract.
    pub async fn update<F, Fut>(&self, transform: F) -> StorageResult<Value>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = StorageResult<Value>>,
    {
        let key = self.key(MANIFEST_FILE)?;
        self.mutex
            .acquire(key.as_str(), async {
                let manifest = self.read().await?;
                transform(manifest).await
            })
            .await
    }

    /// Delete the single blob stored at `file` within this package.
    ///
    /// Tarball names are not handled here; the archive engine owns
    /// their layout. Version/snapshot deletion must be requested
    /// explicitly via `include_versions`.
    pub async fn remove(&self, file: &str, include_versions: bool) -> StorageResult<()> {
        let key = self.key(file)?;
        self.client
            .delete(&key, include_versions)
            .await
            .inspect_err(|err| {
                if !err.is_not_found() {
                    tracing::error!(package = %self.package, %file, %err, "blob delete failed");
                }
            })
            .map_err(StorageError::for_file(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobstore::MemoryBlobStore;
    use serde_json::json;

    fn store() -> ManifestStore {
        ManifestStore::new(
            Arc::new(MemoryBlobStore::new()),
            KeyedMutex::new(),
            "left-pad".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn roundtrip() {
        let manifests = store();
        let manifest = json!({"name": "left-pad", "versions": {}});

        assert!(!manifests.exists().await.unwrap());

        manifests.create(&manifest).await.unwrap();
        assert!(manifests.exists().await.unwrap());
        assert_eq!(manifests.read().await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let manifests = store();
        let err = manifests.read().await.unwrap_err();
        assert!(err.is_not_found(), "expected not-found, got {err}");
    }

    #[tokio::test]
    async fn create_refuses_overwrite() {
        let manifests = store();
        let manifest = json!({"name": "left-pad"});

        manifests.create(&manifest).await.unwrap();
        let err = manifests.create(&manifest).await.unwrap_err();
        assert!(matches!(err, StorageError::FileExists(_)));
    }

    #[tokio::test]
    async fn update_transforms_without_persisting() {
        let manifests = store();
        manifests
            .save(&json!({"name": "left-pad", "versions": {}}))
            .await
            .unwrap();

        let updated = manifests
            .update(|mut manifest| async move {
                manifest["versions"]["1.0.0"] = json!({});
                Ok(manifest)
            })
            .await
            .unwrap();

        assert!(updated["versions"].get("1.0.0").is_some());

        // Not persisted until the caller saves.
        let stored = manifests.read().await.unwrap();
        assert!(stored["versions"].get("1.0.0").is_none());

        manifests.save(&updated).await.unwrap();
        assert_eq!(manifests.read().await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_error_propagates_and_releases_lock() {
        let manifests = store();
        manifests.save(&json!({})).await.unwrap();

        let err = manifests
            .update(|_| async { Err(StorageError::InvalidName("rejected".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));

        // Lock released: a second update proceeds.
        manifests.update(|m| async move { Ok(m) }).await.unwrap();
    }

    #[tokio::test]
    async fn remove_single_blob() {
        let manifests = store();
        manifests.save(&json!({})).await.unwrap();

        manifests.remove(MANIFEST_FILE, false).await.unwrap();
        assert!(!manifests.exists().await.unwrap());
    }
}
