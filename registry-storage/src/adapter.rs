//! The storage adapter facade
//!
//! Composes the manifest store, archive engine, package index and
//! secret store into the storage contract the host registry consumes.
//! One [`RegistryStorage`] instance owns its keyed mutex and caches;
//! separate instances never contend with each other (and provide no
//! coordination with each other either).

use std::future::Future;
use std::sync::Arc;

use blobstore::{BlobClient, BlobReader};
use secret::Secret;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::index::PackageIndex;
use crate::manifest::ManifestStore;
use crate::mutex::KeyedMutex;
use crate::paths;
use crate::secrets::SecretStore;
use crate::tarball::{archive_store, ArchiveSink, ArchiveStore};

/// Storage adapter mapping the registry's storage contract onto a
/// flat key/blob store.
#[derive(Debug, Clone)]
pub struct RegistryStorage {
    client: Arc<dyn BlobClient>,
    config: StorageConfig,
    mutex: KeyedMutex,
    index: PackageIndex,
    secrets: SecretStore,
}

impl RegistryStorage {
    /// Create a new adapter over the given blob store client.
    ///
    /// The archive layout in `config` is fixed for this instance's
    /// lifetime.
    pub fn new(client: Arc<dyn BlobClient>, config: StorageConfig) -> Self {
        let mutex = KeyedMutex::new();
        let index = PackageIndex::new(
            Arc::clone(&client),
            mutex.clone(),
            config.key_prefix.as_deref(),
        );
        let secrets = SecretStore::new(
            Arc::clone(&client),
            mutex.clone(),
            config.key_prefix.as_deref(),
        );

        Self {
            client,
            config,
            mutex,
            index,
            secrets,
        }
    }

    /// Get the per-package handler for a package name.
    pub fn handler(&self, package: &str) -> StorageResult<PackageHandler> {
        paths::validate_package(package)?;

        let manifests = ManifestStore::new(
            Arc::clone(&self.client),
            self.mutex.clone(),
            package.to_string(),
            self.config.key_prefix.clone(),
        );
        let archives = archive_store(
            self.config.layout,
            Arc::clone(&self.client),
            package.to_string(),
            self.config.key_prefix.clone(),
        );

        Ok(PackageHandler {
            package: package.to_string(),
            manifests,
            archives,
        })
    }

    /// All known package names, in insertion order.
    #[tracing::instrument(skip(self))]
    pub async fn list_package_names(&self) -> StorageResult<Vec<String>> {
        self.index.list().await
    }

    /// Record a package name in the registry index.
    #[tracing::instrument(skip(self))]
    pub async fn add_package_name(&self, name: &str) -> StorageResult<()> {
        self.index.add(name).await
    }

    /// Drop a package name from the registry index.
    ///
    /// Blob deletion for the package's files is separate and
    /// best-effort; it is not atomic with the index update.
    #[tracing::instrument(skip(self))]
    pub async fn remove_package_name(&self, name: &str) -> StorageResult<()> {
        self.index.remove(name).await
    }

    /// The registry signing secret, loaded lazily.
    pub async fn get_signing_secret(&self) -> StorageResult<Secret> {
        self.secrets.get().await
    }

    /// Store the registry signing secret.
    pub async fn set_signing_secret(&self, secret: Secret) -> StorageResult<()> {
        self.secrets.set(secret).await
    }

    /// Search is declared by the storage contract but not implemented
    /// by this adapter.
    pub async fn search(&self, _query: &str) -> StorageResult<Vec<String>> {
        Err(StorageError::Unsupported("search"))
    }

    /// Access-token persistence is declared by the storage contract
    /// but not implemented by this adapter.
    pub async fn save_token(&self, _token: &Value) -> StorageResult<()> {
        Err(StorageError::Unsupported("token storage"))
    }

    /// Access-token retrieval is declared by the storage contract but
    /// not implemented by this adapter.
    pub async fn read_tokens(&self) -> StorageResult<Vec<Value>> {
        Err(StorageError::Unsupported("token storage"))
    }
}

/// Per-package storage operations.
///
/// Handlers are created on demand by
/// [`RegistryStorage::handler`] and hold no state beyond derived
/// store handles; creating two handlers for the same package is fine,
/// they share the adapter's locks and caches.
#[derive(Debug, Clone)]
pub struct PackageHandler {
    package: String,
    manifests: ManifestStore,
    archives: Arc<dyn ArchiveStore>,
}

impl PackageHandler {
    /// The package this handler operates on.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Whether the package's manifest exists.
    pub async fn has_manifest(&self) -> StorageResult<bool> {
        self.manifests.exists().await
    }

    /// Create the package's manifest, refusing to overwrite.
    #[tracing::instrument(skip(self, manifest), fields(package = %self.package))]
    pub async fn create_manifest(&self, manifest: &Value) -> StorageResult<()> {
        self.manifests.create(manifest).await
    }

    /// Read the package's manifest.
    pub async fn read_manifest(&self) -> StorageResult<Value> {
        self.manifests.read().await
    }

    /// Overwrite the package's manifest.
    #[tracing::instrument(skip(self, manifest), fields(package = %self.package))]
    pub async fn save_manifest(&self, manifest: &Value) -> StorageResult<()> {
        self.manifests.save(manifest).await
    }

    /// Read and transform the manifest under the package's lock.
    ///
    /// The transformed manifest is returned, not persisted; commit it
    /// with [`save_manifest`](PackageHandler::save_manifest).
    pub async fn update_manifest<F, Fut>(&self, transform: F) -> StorageResult<Value>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = StorageResult<Value>>,
    {
        self.manifests.update(transform).await
    }

    /// Delete a file belonging to the package.
    ///
    /// Names following the tarball convention are routed to the
    /// archive engine, which in the unpacked layout sweeps the
    /// archive's whole key prefix. Version/snapshot deletion happens
    /// only when `include_versions` is set.
    #[tracing::instrument(skip(self), fields(package = %self.package))]
    pub async fn delete_file(&self, name: &str, include_versions: bool) -> StorageResult<()> {
        if paths::is_tarball(name) {
            self.archives.delete(name, include_versions).await
        } else {
            self.manifests.remove(name, include_versions).await
        }
    }

    /// Open a stream reading the named archive's compressed bytes.
    #[tracing::instrument(skip(self, cancel), fields(package = %self.package))]
    pub async fn read_archive(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> StorageResult<BlobReader> {
        self.archives.read(name, cancel).await
    }

    /// Open a sink writing the named archive's compressed bytes.
    #[tracing::instrument(skip(self, cancel), fields(package = %self.package))]
    pub async fn write_archive(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> StorageResult<ArchiveSink> {
        self.archives.write(name, cancel).await
    }

    /// Whether the named archive exists.
    pub async fn has_archive(&self, name: &str) -> StorageResult<bool> {
        self.archives.exists(name).await
    }
}
